//! Store internals: shared state, locking helpers, and the staging
//! primitives every public operation is built from.
//!
//! A staging primitive makes exactly one structural change and tags it with
//! a fresh step number, in this order:
//!
//! 1. apply it to the collection tree (which records the undo entry)
//! 2. append the journal record
//! 3. tell the index providers
//!
//! so that rolling back to any earlier step undoes all three together.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::{DbError, DbResult};
use crate::index::{IndexEvent, IndexSet};
use crate::journal::JournalRecord;
use crate::lock::{LockManager, LockMode, LockTarget};
use crate::storage::{
    Access, CollectionConfig, CollectionPath, CollectionTree, Document, DocumentName, DocumentPath, Permissions,
};
use crate::transaction::{Transaction, TransactionManager};
use crate::trigger::{TriggerOperation, TriggerPipeline};

pub(crate) struct StoreInner {
    pub(crate) tree: Arc<CollectionTree>,
    pub(crate) indexes: Arc<IndexSet>,
    pub(crate) pipeline: TriggerPipeline,
    pub(crate) transactions: TransactionManager,
    pub(crate) lock_timeout: Duration,
}

/// The collection/document store.
///
/// Cheap to clone; every clone operates on the same tree, indexes and
/// trigger pipeline. All mutations run under a caller-supplied
/// [`Transaction`].
#[derive(Clone)]
pub struct CollectionStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl CollectionStore {
    pub fn new(
        tree: Arc<CollectionTree>,
        indexes: Arc<IndexSet>,
        pipeline: TriggerPipeline,
        transactions: TransactionManager,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                tree,
                indexes,
                pipeline,
                transactions,
                lock_timeout,
            }),
        }
    }

    pub fn tree(&self) -> &CollectionTree {
        &self.inner.tree
    }

    pub fn indexes(&self) -> &IndexSet {
        &self.inner.indexes
    }

    pub fn pipeline(&self) -> &TriggerPipeline {
        &self.inner.pipeline
    }

    pub fn locks(&self) -> &LockManager {
        self.inner.transactions.locks()
    }

    /// Manager for the short transactions the store runs on its own.
    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    // ==================== Atomicity ====================

    /// Run one public operation so that it either fully applies or leaves
    /// the transaction as it was before the call.
    ///
    /// Errors that abort the transaction abort it here; any other error
    /// rolls back to the savepoint taken on entry.
    pub(crate) fn atomically<T>(
        &self,
        tx: &mut Transaction,
        op: impl FnOnce(&mut Transaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tx.ensure_active()?;
        let savepoint = tx.savepoint();

        let err = match op(tx) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !tx.is_active() {
            // a nested operation already aborted it
        } else if err.aborts_transaction() {
            warn!(txn = %tx.id(), error = %err, "operation failed, aborting transaction");
            tx.abort_in_place();
        } else if let Err(rollback) = tx.rollback_to(&savepoint) {
            warn!(txn = %tx.id(), error = %rollback, "rollback to savepoint failed, aborting transaction");
            tx.abort_in_place();
        }
        Err(err)
    }

    /// Run `apply` inside every operation in `ops`, the first one outermost:
    /// all before-hooks fire in order, then `apply`, then the after-hooks in
    /// reverse.
    pub(crate) fn run_nested<T>(
        &self,
        tx: &mut Transaction,
        mut ops: VecDeque<TriggerOperation>,
        apply: Box<dyn FnOnce(&mut Transaction) -> DbResult<T> + '_>,
    ) -> DbResult<T> {
        match ops.pop_front() {
            None => apply(tx),
            Some(mut op) => op.run(self, tx, move |tx| self.run_nested(tx, ops, apply)),
        }
    }

    // ==================== Checks ====================

    pub(crate) fn require_collection(&self, path: &CollectionPath) -> DbResult<()> {
        if self.tree().exists(path) {
            Ok(())
        } else {
            Err(DbError::not_found(format!("collection {}", path)))
        }
    }

    pub(crate) fn check_access(&self, tx: &Transaction, collection: &CollectionPath, access: Access) -> DbResult<()> {
        let permissions = self
            .tree()
            .permissions(collection)
            .ok_or_else(|| DbError::not_found(format!("collection {}", collection)))?;
        if permissions.allows(tx.subject(), access) {
            return Ok(());
        }
        Err(DbError::PermissionDenied {
            subject: tx.subject().name().to_string(),
            access: access.to_string(),
            target: collection.to_string(),
        })
    }

    // ==================== Locking ====================

    /// Lock a collection, failing with `InvalidState` if it was removed while
    /// the caller waited.
    pub(crate) fn lock_collection(&self, tx: &mut Transaction, path: &CollectionPath, mode: LockMode) -> DbResult<()> {
        tx.lock_checked(LockTarget::collection(path), mode, |_| self.inner.tree.exists(path))
    }

    pub(crate) fn lock_document(&self, tx: &mut Transaction, path: &DocumentPath, mode: LockMode) -> DbResult<()> {
        tx.lock(LockTarget::document(path), mode)
    }

    /// Lock `root` and every collection below it in `mode`, together with
    /// `extra`, in the global order. Returns the subtree, parents first.
    ///
    /// Children created while the first batch was being acquired are picked
    /// up by another round; once every collection of the subtree is held, no
    /// new child can appear under it.
    pub(crate) fn lock_subtree(
        &self,
        tx: &mut Transaction,
        root: &CollectionPath,
        mode: LockMode,
        extra: Vec<(LockTarget, LockMode)>,
    ) -> DbResult<Vec<CollectionPath>> {
        let mut locked: BTreeSet<CollectionPath> = BTreeSet::new();
        let mut extra = Some(extra);
        loop {
            let current = self.tree().subtree(root);
            if current.is_empty() {
                return Err(DbError::invalid_state(format!("collection {} was removed", root)));
            }
            let missing: Vec<CollectionPath> = current.iter().filter(|p| !locked.contains(*p)).cloned().collect();
            if missing.is_empty() && extra.is_none() {
                return Ok(current);
            }

            let mut targets: Vec<(LockTarget, LockMode)> = extra.take().unwrap_or_default();
            targets.extend(missing.iter().map(|p| (LockTarget::collection(p), mode)));
            tx.lock_all(targets)?;
            locked.extend(missing);
        }
    }

    // ==================== Staging primitives ====================

    pub(crate) fn stage_create(
        &self,
        tx: &mut Transaction,
        path: &CollectionPath,
        permissions: Permissions,
    ) -> DbResult<()> {
        let step = tx.next_step();
        self.tree().create_collection(tx.id(), step, path, permissions.clone())?;
        tx.log(
            step,
            JournalRecord::CreateCollection {
                path: path.clone(),
                permissions,
            },
        )?;
        trace!(txn = %tx.id(), step, collection = %path, "collection created");
        Ok(())
    }

    pub(crate) fn stage_remove_collection(&self, tx: &mut Transaction, path: &CollectionPath) -> DbResult<()> {
        let step = tx.next_step();
        let config = self.tree().config(path);
        self.tree().remove_collection(tx.id(), step, path)?;
        tx.log(step, JournalRecord::RemoveCollection { path: path.clone() })?;
        if config.is_some() {
            self.indexes().reconfigure(tx.id(), step, path, None)?;
        }
        Ok(())
    }

    /// Add a document under a name that is currently free.
    pub(crate) fn stage_insert(
        &self,
        tx: &mut Transaction,
        collection: &CollectionPath,
        document: Document,
    ) -> DbResult<()> {
        let step = tx.next_step();
        let previous = self
            .tree()
            .put_document(tx.id(), step, collection, document.clone())?;
        if let Some(previous) = previous {
            // the caller's savepoint rollback puts it back
            return Err(DbError::invalid_state(format!(
                "{}/{} was not removed before insert",
                collection, previous.name
            )));
        }
        tx.log(
            step,
            JournalRecord::StoreDocument {
                collection: collection.clone(),
                document: document.clone(),
            },
        )?;
        self.indexes()
            .observe(tx.id(), step, collection, &document, IndexEvent::Added)?;
        trace!(txn = %tx.id(), step, document = %DocumentPath::new(collection.clone(), document.name.clone()), "document stored");
        Ok(())
    }

    pub(crate) fn stage_take(
        &self,
        tx: &mut Transaction,
        collection: &CollectionPath,
        name: &DocumentName,
    ) -> DbResult<Document> {
        let step = tx.next_step();
        let document = self.tree().take_document(tx.id(), step, collection, name)?;
        tx.log(
            step,
            JournalRecord::RemoveDocument {
                collection: collection.clone(),
                name: name.clone(),
            },
        )?;
        self.indexes()
            .observe(tx.id(), step, collection, &document, IndexEvent::Removed)?;
        Ok(document)
    }

    /// Replace the configuration of `path` and re-derive the index entries
    /// of every document below it.
    pub(crate) fn stage_config(
        &self,
        tx: &mut Transaction,
        path: &CollectionPath,
        subtree: &[CollectionPath],
        config: Option<CollectionConfig>,
    ) -> DbResult<()> {
        let step = tx.next_step();
        self.tree().set_config(tx.id(), step, path, config.clone())?;
        tx.log(
            step,
            JournalRecord::Configure {
                path: path.clone(),
                config: config.clone(),
            },
        )?;
        self.indexes()
            .reconfigure(tx.id(), step, path, config.as_ref().map(|c| &c.index))?;
        self.reindex(tx, step, subtree)
    }

    /// Relocate the subtree at `from` to `to`, keeping document identities.
    pub(crate) fn stage_move_collection(
        &self,
        tx: &mut Transaction,
        from: &CollectionPath,
        to: &CollectionPath,
        subtree: &[CollectionPath],
    ) -> DbResult<()> {
        let step = tx.next_step();
        let scoped: Vec<(CollectionPath, CollectionConfig)> = subtree
            .iter()
            .filter_map(|p| Some((p.clone(), self.tree().config(p)?)))
            .collect();
        let documents: Vec<(CollectionPath, Vec<Document>)> = subtree
            .iter()
            .map(|p| (p.clone(), self.tree().documents(p).unwrap_or_default()))
            .collect();

        self.tree().move_collection(tx.id(), step, from, to)?;
        tx.log(
            step,
            JournalRecord::MoveCollection {
                from: from.clone(),
                to: to.clone(),
            },
        )?;

        let indexes = self.indexes();
        for (scope, config) in &scoped {
            let rebased = rebase(scope, from, to)?;
            indexes.reconfigure(tx.id(), step, scope, None)?;
            indexes.reconfigure(tx.id(), step, &rebased, Some(&config.index))?;
        }
        for (collection, docs) in &documents {
            let rebased = rebase(collection, from, to)?;
            for document in docs {
                indexes.observe(tx.id(), step, collection, document, IndexEvent::Removed)?;
                indexes.observe(tx.id(), step, &rebased, document, IndexEvent::Added)?;
            }
        }
        Ok(())
    }

    /// Re-derive index entries for every document in `collections`.
    fn reindex(&self, tx: &mut Transaction, step: u64, collections: &[CollectionPath]) -> DbResult<()> {
        let indexes = self.indexes();
        let mut count = 0usize;
        for collection in collections {
            for document in self.tree().documents(collection).unwrap_or_default() {
                indexes.observe(tx.id(), step, collection, &document, IndexEvent::Removed)?;
                indexes.observe(tx.id(), step, collection, &document, IndexEvent::Added)?;
                count += 1;
            }
        }
        trace!(txn = %tx.id(), step, documents = count, "documents reindexed");
        Ok(())
    }
}

fn rebase(path: &CollectionPath, from: &CollectionPath, to: &CollectionPath) -> DbResult<CollectionPath> {
    path.rebase(from, to)
        .ok_or_else(|| DbError::invalid_state(format!("{} is not below {}", path, from)))
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStore")
            .field("tree", &self.inner.tree)
            .field("indexes", &self.inner.indexes)
            .finish()
    }
}

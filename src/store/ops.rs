//! Public store operations.
//!
//! Lock protocol, in the global order (parent before child, collection
//! before its documents):
//!
//! | operation             | locks                                                          |
//! |-----------------------|----------------------------------------------------------------|
//! | create collection     | parent WRITE, new collection WRITE                             |
//! | store / remove doc    | collection WRITE, document WRITE                               |
//! | remove collection     | parent WRITE, whole subtree WRITE                              |
//! | move / copy document  | both collections WRITE (source READ for copy), both documents  |
//! | move collection       | both parents WRITE, new path WRITE, source subtree WRITE       |
//! | copy collection       | destination WRITE, new path WRITE, source subtree READ         |
//! | configure             | whole subtree WRITE                                            |
//! | reads                 | collection READ, document READ                                 |
//!
//! Adding or removing a member writes the collection, so a reader holding
//! the collection READ never sees members of a transaction that has not
//! committed. Every lock is held until the transaction ends. Triggers that
//! write elsewhere (the history archive) lock their own targets when they
//! run, outside this order; a wait cycle through them ends in `LockTimeout`.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::index::NodeRef;
use crate::lock::{LockMode, LockTarget};
use crate::storage::{
    Access, CollectionConfig, CollectionPath, Content, Document, DocumentId, DocumentName, DocumentPath,
    Permissions,
};
use crate::store::engine::CollectionStore;
use crate::transaction::Transaction;
use crate::trigger::{OperationKind, TriggerEvent, TriggerTarget};

/// A collection or a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Collection(CollectionPath),
    Document(DocumentPath),
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceRef::Collection(path) => write!(f, "{}", path),
            ResourceRef::Document(path) => write!(f, "{}", path),
        }
    }
}

impl From<CollectionPath> for ResourceRef {
    fn from(path: CollectionPath) -> Self {
        ResourceRef::Collection(path)
    }
}

impl From<DocumentPath> for ResourceRef {
    fn from(path: DocumentPath) -> Self {
        ResourceRef::Document(path)
    }
}

impl CollectionStore {
    // ==================== Collections ====================

    /// Create `path` and any missing ancestors. Returns false if it already
    /// existed.
    pub fn create_collection(&self, tx: &mut Transaction, path: &CollectionPath) -> DbResult<bool> {
        self.atomically(tx, |tx| {
            if self.tree().exists(path) {
                // waits out a creator that has not committed yet
                self.lock_collection(tx, path, LockMode::Read)?;
                return Ok(false);
            }
            for ancestor in path.lineage() {
                if !self.tree().exists(&ancestor) {
                    self.create_one(tx, &ancestor)?;
                }
            }
            Ok(true)
        })
    }

    fn create_one(&self, tx: &mut Transaction, path: &CollectionPath) -> DbResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        self.lock_collection(tx, &parent, LockMode::Write)?;
        tx.lock(LockTarget::collection(path), LockMode::Write)?;
        if self.tree().exists(path) {
            return Ok(());
        }
        self.check_access(tx, &parent, Access::Write)?;

        let event = TriggerEvent::new(OperationKind::Create, TriggerTarget::Collection(path.clone()));
        let permissions = Permissions::owned_by(tx.subject());
        self.pipeline()
            .operation(self.tree(), event)?
            .run(self, tx, |tx| self.stage_create(tx, path, permissions))
    }

    /// Attach `config` to `path` (or detach with `None`). Index entries of
    /// every document below `path` are re-derived in the same transaction.
    pub fn configure_collection(
        &self,
        tx: &mut Transaction,
        path: &CollectionPath,
        config: Option<CollectionConfig>,
    ) -> DbResult<()> {
        self.atomically(tx, |tx| {
            self.require_collection(path)?;
            if let Some(config) = &config {
                self.pipeline().validate(&config.triggers)?;
            }
            let subtree = self.lock_subtree(tx, path, LockMode::Write, Vec::new())?;
            self.check_access(tx, path, Access::Write)?;
            self.stage_config(tx, path, &subtree, config)?;
            info!(collection = %path, collections = subtree.len(), "collection configured");
            Ok(())
        })
    }

    // ==================== Documents ====================

    /// Store `content` as `collection/name`, replacing any existing
    /// document of that name.
    pub fn store(
        &self,
        tx: &mut Transaction,
        collection: &CollectionPath,
        name: &DocumentName,
        content: Content,
    ) -> DbResult<DocumentId> {
        let mime = content.default_mime();
        self.store_with_mime(tx, collection, name, content, mime)
    }

    pub fn store_with_mime(
        &self,
        tx: &mut Transaction,
        collection: &CollectionPath,
        name: &DocumentName,
        content: Content,
        mime: &str,
    ) -> DbResult<DocumentId> {
        self.atomically(tx, |tx| {
            self.put(tx, collection, name, content, mime, OperationKind::Store)
        })
    }

    /// Store or replace one document, firing `kind`.
    pub(crate) fn put(
        &self,
        tx: &mut Transaction,
        collection: &CollectionPath,
        name: &DocumentName,
        content: Content,
        mime: &str,
        kind: OperationKind,
    ) -> DbResult<DocumentId> {
        content.validate()?;
        self.require_collection(collection)?;
        let path = DocumentPath::new(collection.clone(), name.clone());
        self.lock_collection(tx, collection, LockMode::Write)?;
        self.lock_document(tx, &path, LockMode::Write)?;
        self.check_access(tx, collection, Access::Write)?;

        let previous = self.tree().document(collection, name);
        let id = self.tree().allocate_id();
        let mut document = Document::new(id, name.clone(), content).with_mime(mime);
        if let Some(previous) = &previous {
            document = document.succeeding(previous);
        }

        let event = TriggerEvent::new(kind, TriggerTarget::Document(path.clone()))
            .replacing(previous)
            .with_document(document.clone());
        self.pipeline().operation(self.tree(), event)?.run(self, tx, |tx| {
            if self.tree().has_document(&path) {
                self.stage_take(tx, collection, name)?;
            }
            self.stage_insert(tx, collection, document)?;
            Ok(id)
        })
    }

    /// Remove a document, or a collection with everything below it.
    pub fn remove(&self, tx: &mut Transaction, target: &ResourceRef) -> DbResult<()> {
        match target {
            ResourceRef::Document(path) => self.remove_document(tx, path),
            ResourceRef::Collection(path) => self.remove_collection(tx, path),
        }
    }

    pub fn remove_document(&self, tx: &mut Transaction, path: &DocumentPath) -> DbResult<()> {
        self.atomically(tx, |tx| self.drop_document(tx, path))
    }

    pub(crate) fn drop_document(&self, tx: &mut Transaction, path: &DocumentPath) -> DbResult<()> {
        self.require_collection(&path.collection)?;
        self.lock_collection(tx, &path.collection, LockMode::Write)?;
        self.lock_document(tx, path, LockMode::Write)?;
        let document = self
            .tree()
            .document(&path.collection, &path.name)
            .ok_or_else(|| DbError::not_found(format!("document {}", path)))?;
        self.check_access(tx, &path.collection, Access::Write)?;

        let event = TriggerEvent::new(OperationKind::Remove, TriggerTarget::Document(path.clone())).with_document(document);
        self.pipeline()
            .operation(self.tree(), event)?
            .run(self, tx, |tx| self.stage_take(tx, &path.collection, &path.name).map(|_| ()))
    }

    /// Remove a collection and its whole subtree. Triggers fire for the
    /// collection and then once for every document removed with it.
    pub fn remove_collection(&self, tx: &mut Transaction, path: &CollectionPath) -> DbResult<()> {
        self.atomically(tx, |tx| {
            let parent = path
                .parent()
                .ok_or_else(|| DbError::invalid_state("the root collection cannot be removed"))?;
            self.require_collection(path)?;
            let subtree = self.lock_subtree(
                tx,
                path,
                LockMode::Write,
                vec![(LockTarget::collection(&parent), LockMode::Write)],
            )?;
            self.check_access(tx, &parent, Access::Write)?;

            let event = TriggerEvent::new(OperationKind::Remove, TriggerTarget::Collection(path.clone()));
            let removed = self.pipeline().operation(self.tree(), event)?.run(self, tx, |tx| {
                let mut removed = 0usize;
                // children before parents
                for collection in subtree.iter().rev() {
                    for document in self.tree().documents(collection).unwrap_or_default() {
                        let doc_path = DocumentPath::new(collection.clone(), document.name.clone());
                        self.lock_document(tx, &doc_path, LockMode::Write)?;
                        let event = TriggerEvent::new(OperationKind::Remove, TriggerTarget::Document(doc_path))
                            .with_document(document.clone());
                        self.pipeline().operation(self.tree(), event)?.run(self, tx, |tx| {
                            self.stage_take(tx, collection, &document.name).map(|_| ())
                        })?;
                        removed += 1;
                    }
                    self.stage_remove_collection(tx, collection)?;
                }
                Ok(removed)
            })?;

            debug!(collection = %path, collections = subtree.len(), documents = removed, "collection removed");
            Ok(())
        })
    }

    // ==================== Move / copy ====================

    /// Move a document into `destination`, optionally renaming it. An
    /// existing document at the new path is replaced.
    pub fn move_document(
        &self,
        tx: &mut Transaction,
        source: &DocumentPath,
        destination: &CollectionPath,
        new_name: Option<&DocumentName>,
    ) -> DbResult<DocumentPath> {
        self.atomically(tx, |tx| self.transfer_document(tx, source, destination, new_name, OperationKind::Move))
    }

    /// Copy a document into `destination`. The copy gets a fresh identity.
    pub fn copy_document(
        &self,
        tx: &mut Transaction,
        source: &DocumentPath,
        destination: &CollectionPath,
        new_name: Option<&DocumentName>,
    ) -> DbResult<DocumentPath> {
        self.atomically(tx, |tx| self.transfer_document(tx, source, destination, new_name, OperationKind::Copy))
    }

    fn transfer_document(
        &self,
        tx: &mut Transaction,
        source: &DocumentPath,
        destination: &CollectionPath,
        new_name: Option<&DocumentName>,
        kind: OperationKind,
    ) -> DbResult<DocumentPath> {
        let target = DocumentPath::new(
            destination.clone(),
            new_name.cloned().unwrap_or_else(|| source.name.clone()),
        );
        if target == *source {
            return Err(DbError::invalid_state(format!("cannot {} {} onto itself", kind, source)));
        }
        self.require_collection(&source.collection)?;
        self.require_collection(destination)?;

        let source_mode = if kind == OperationKind::Move {
            LockMode::Write
        } else {
            LockMode::Read
        };
        tx.lock_all([
            (LockTarget::collection(&source.collection), source_mode),
            (LockTarget::document(source), source_mode),
            (LockTarget::collection(destination), LockMode::Write),
            (LockTarget::document(&target), LockMode::Write),
        ])?;
        for collection in [&source.collection, destination] {
            if !self.tree().exists(collection) {
                return Err(DbError::invalid_state(format!("collection {} was removed", collection)));
            }
        }

        let original = self
            .tree()
            .document(&source.collection, &source.name)
            .ok_or_else(|| DbError::not_found(format!("document {}", source)))?;
        if kind == OperationKind::Move {
            self.check_access(tx, &source.collection, Access::Write)?;
        } else {
            self.check_access(tx, &source.collection, Access::Read)?;
        }
        self.check_access(tx, destination, Access::Write)?;

        let replaces = self.tree().document(destination, &target.name);
        let mut document = if kind == OperationKind::Move {
            let mut moved = original.clone();
            moved.name = target.name.clone();
            moved
        } else {
            Document::new(self.tree().allocate_id(), target.name.clone(), original.content.clone())
                .with_mime(original.mime.clone())
        };
        if let Some(previous) = &replaces {
            if kind == OperationKind::Copy {
                document = document.succeeding(previous);
            }
        }

        let event = TriggerEvent::new(kind, TriggerTarget::Document(source.clone()))
            .with_destination(TriggerTarget::Document(target.clone()))
            .replacing(replaces)
            .with_document(document.clone());
        self.pipeline().operation(self.tree(), event)?.run(self, tx, |tx| {
            if self.tree().has_document(&target) {
                self.stage_take(tx, destination, &target.name)?;
            }
            if kind == OperationKind::Move {
                self.stage_take(tx, &source.collection, &source.name)?;
            }
            self.stage_insert(tx, destination, document)?;
            Ok(())
        })?;
        Ok(target)
    }

    /// Move a collection with its subtree below `destination`, optionally
    /// renaming it. Fails with `InvalidState` if the new path exists or lies
    /// inside the source. Move hooks fire once for the collection and once
    /// for every document moved with it.
    pub fn move_collection(
        &self,
        tx: &mut Transaction,
        source: &CollectionPath,
        destination: &CollectionPath,
        new_name: Option<&str>,
    ) -> DbResult<CollectionPath> {
        self.atomically(tx, |tx| {
            let (source_parent, target) = self.transfer_target(source, destination, new_name)?;
            let subtree = self.lock_subtree(
                tx,
                source,
                LockMode::Write,
                vec![
                    (LockTarget::collection(&source_parent), LockMode::Write),
                    (LockTarget::collection(destination), LockMode::Write),
                    (LockTarget::collection(&target), LockMode::Write),
                ],
            )?;
            self.check_transfer_target(destination, &target)?;
            self.lock_rebased(tx, &subtree, source, &target)?;
            self.check_access(tx, &source_parent, Access::Write)?;
            self.check_access(tx, destination, Access::Write)?;

            let mut ops = VecDeque::new();
            let event = TriggerEvent::new(OperationKind::Move, TriggerTarget::Collection(source.clone()))
                .with_destination(TriggerTarget::Collection(target.clone()));
            ops.push_back(self.pipeline().operation(self.tree(), event)?);
            for collection in &subtree {
                let rebased = collection
                    .rebase(source, &target)
                    .ok_or_else(|| DbError::invalid_state(format!("{} is not below {}", collection, source)))?;
                for document in self.tree().documents(collection).unwrap_or_default() {
                    let from = DocumentPath::new(collection.clone(), document.name.clone());
                    let to = DocumentPath::new(rebased.clone(), document.name.clone());
                    let event = TriggerEvent::new(OperationKind::Move, TriggerTarget::Document(from))
                        .with_destination(TriggerTarget::Document(to))
                        .with_document(document);
                    ops.push_back(self.pipeline().operation(self.tree(), event)?);
                }
            }

            let documents = ops.len() - 1;
            self.run_nested(
                tx,
                ops,
                Box::new(|tx: &mut Transaction| self.stage_move_collection(tx, source, &target, &subtree)),
            )?;
            info!(from = %source, to = %target, documents, "collection moved");
            Ok(target)
        })
    }

    /// Copy a collection with its subtree below `destination`. Copied
    /// documents get fresh identities; configurations and permissions are
    /// carried over.
    pub fn copy_collection(
        &self,
        tx: &mut Transaction,
        source: &CollectionPath,
        destination: &CollectionPath,
        new_name: Option<&str>,
    ) -> DbResult<CollectionPath> {
        self.atomically(tx, |tx| {
            let (_, target) = self.transfer_target(source, destination, new_name)?;
            let subtree = self.lock_subtree(
                tx,
                source,
                LockMode::Read,
                vec![
                    (LockTarget::collection(destination), LockMode::Write),
                    (LockTarget::collection(&target), LockMode::Write),
                ],
            )?;
            self.check_transfer_target(destination, &target)?;
            self.lock_rebased(tx, &subtree, source, &target)?;
            self.check_access(tx, source, Access::Read)?;
            self.check_access(tx, destination, Access::Write)?;

            let event = TriggerEvent::new(OperationKind::Copy, TriggerTarget::Collection(source.clone()))
                .with_destination(TriggerTarget::Collection(target.clone()));
            let copied = self.pipeline().operation(self.tree(), event)?.run(self, tx, |tx| {
                let mut copied = 0usize;
                for collection in &subtree {
                    let rebased = collection
                        .rebase(source, &target)
                        .ok_or_else(|| DbError::invalid_state(format!("{} is not below {}", collection, source)))?;
                    let permissions = self
                        .tree()
                        .permissions(collection)
                        .unwrap_or_else(|| Permissions::owned_by(tx.subject()));
                    self.stage_create(tx, &rebased, permissions)?;
                    if let Some(config) = self.tree().config(collection) {
                        self.stage_config(tx, &rebased, &[], Some(config))?;
                    }

                    for original in self.tree().documents(collection).unwrap_or_default() {
                        let from = DocumentPath::new(collection.clone(), original.name.clone());
                        let to = DocumentPath::new(rebased.clone(), original.name.clone());
                        self.lock_document(tx, &to, LockMode::Write)?;
                        let document =
                            Document::new(self.tree().allocate_id(), original.name.clone(), original.content.clone())
                                .with_mime(original.mime.clone());
                        let event = TriggerEvent::new(OperationKind::Copy, TriggerTarget::Document(from))
                            .with_destination(TriggerTarget::Document(to))
                            .with_document(document.clone());
                        self.pipeline()
                            .operation(self.tree(), event)?
                            .run(self, tx, |tx| self.stage_insert(tx, &rebased, document))?;
                        copied += 1;
                    }
                }
                Ok(copied)
            })?;

            info!(from = %source, to = %target, documents = copied, "collection copied");
            Ok(target)
        })
    }

    /// Resolve the new path of a collection transfer, rejecting cycles.
    fn transfer_target(
        &self,
        source: &CollectionPath,
        destination: &CollectionPath,
        new_name: Option<&str>,
    ) -> DbResult<(CollectionPath, CollectionPath)> {
        let source_parent = source
            .parent()
            .ok_or_else(|| DbError::invalid_state("the root collection cannot be moved or copied"))?;
        let target = destination.child(new_name.unwrap_or_else(|| source.name()))?;
        if target.is_within(source) || destination.is_within(source) {
            return Err(DbError::invalid_state(format!(
                "cannot place {} inside itself at {}",
                source, target
            )));
        }
        self.require_collection(source)?;
        self.require_collection(destination)?;
        Ok((source_parent, target))
    }

    fn check_transfer_target(&self, destination: &CollectionPath, target: &CollectionPath) -> DbResult<()> {
        if !self.tree().exists(destination) {
            return Err(DbError::invalid_state(format!("collection {} was removed", destination)));
        }
        if self.tree().exists(target) {
            return Err(DbError::invalid_state(format!("collection {} already exists", target)));
        }
        Ok(())
    }

    /// WRITE-lock the paths a transferred subtree will occupy, so nobody
    /// touches them before the transfer commits.
    fn lock_rebased(
        &self,
        tx: &mut Transaction,
        subtree: &[CollectionPath],
        source: &CollectionPath,
        target: &CollectionPath,
    ) -> DbResult<()> {
        let rebased = subtree
            .iter()
            .filter_map(|path| path.rebase(source, target))
            .map(|path| (LockTarget::Collection(path), LockMode::Write));
        tx.lock_all(rebased)
    }

    // ==================== Reads ====================

    /// Read a document within `tx`.
    pub fn document(&self, tx: &mut Transaction, path: &DocumentPath) -> DbResult<Document> {
        tx.ensure_active()?;
        self.require_collection(&path.collection)?;
        self.lock_collection(tx, &path.collection, LockMode::Read)?;
        self.lock_document(tx, path, LockMode::Read)?;
        self.check_access(tx, &path.collection, Access::Read)?;
        self.tree()
            .document(&path.collection, &path.name)
            .ok_or_else(|| DbError::not_found(format!("document {}", path)))
    }

    /// Documents of `collection`, ordered by name.
    pub fn list_documents(&self, tx: &mut Transaction, collection: &CollectionPath) -> DbResult<Vec<Document>> {
        tx.ensure_active()?;
        self.require_collection(collection)?;
        self.lock_collection(tx, collection, LockMode::Read)?;
        self.check_access(tx, collection, Access::Read)?;
        self.tree()
            .documents(collection)
            .ok_or_else(|| DbError::not_found(format!("collection {}", collection)))
    }

    /// Child collections of `collection`, ordered by name.
    pub fn list_collections(
        &self,
        tx: &mut Transaction,
        collection: &CollectionPath,
    ) -> DbResult<Vec<CollectionPath>> {
        tx.ensure_active()?;
        self.require_collection(collection)?;
        self.lock_collection(tx, collection, LockMode::Read)?;
        self.check_access(tx, collection, Access::Read)?;
        let names = self
            .tree()
            .child_names(collection)
            .ok_or_else(|| DbError::not_found(format!("collection {}", collection)))?;
        names
            .iter()
            .map(|name| collection.child(name).map_err(DbError::from))
            .collect()
    }

    /// Whether `path` exists, checked under a short-lived READ lock.
    pub fn collection_exists(&self, path: &CollectionPath) -> DbResult<bool> {
        let holder = self.locks().new_holder();
        let _guard = self.locks().acquire(
            LockTarget::collection(path),
            LockMode::Read,
            holder,
            self.inner.lock_timeout,
        )?;
        Ok(self.tree().exists(path))
    }

    /// Read a committed document outside any transaction, as an ambient
    /// lock holder.
    pub fn fetch_document(&self, path: &DocumentPath) -> DbResult<Document> {
        let holder = self.locks().new_holder();
        let _guards = self.locks().acquire_all(
            [
                (LockTarget::collection(&path.collection), LockMode::Read),
                (LockTarget::document(path), LockMode::Read),
            ],
            holder,
            self.inner.lock_timeout,
        )?;
        self.tree()
            .document(&path.collection, &path.name)
            .ok_or_else(|| DbError::not_found(format!("document {}", path)))
    }

    /// Whether `path` names a collection or a document, checked under
    /// short-lived READ locks like [`fetch_document`](Self::fetch_document).
    pub fn resolve(&self, path: &str) -> DbResult<ResourceRef> {
        if let Ok(collection) = CollectionPath::new(path) {
            if self.collection_exists(&collection)? {
                return Ok(ResourceRef::Collection(collection));
            }
        }
        let document = DocumentPath::parse(path)?;
        match self.fetch_document(&document) {
            Ok(_) => Ok(ResourceRef::Document(document)),
            Err(e) if e.is_not_found() => Err(DbError::not_found(path)),
            Err(e) => Err(e),
        }
    }

    /// Make sure `path` exists.
    ///
    /// Missing collections are created by a transaction of their own on
    /// behalf of the caller's subject, which commits before this returns, so
    /// the parent is not held until `tx` ends. If `tx` already holds a lock
    /// on the nearest existing ancestor, they are created within `tx`
    /// instead, since a separate transaction would wait for `tx` itself.
    pub fn ensure_collection(&self, tx: &mut Transaction, path: &CollectionPath) -> DbResult<()> {
        if self.tree().exists(path) {
            return Ok(());
        }
        let base = path.lineage().into_iter().rev().find(|p| self.tree().exists(p));
        let holds_base = base
            .map(|base| self.locks().held_mode(&LockTarget::Collection(base), tx.holder()).is_some())
            .unwrap_or(false);
        if holds_base {
            return self.create_collection(tx, path).map(|_| ());
        }

        self.transactions()
            .with_transaction_as(tx.subject().clone(), |own| self.create_collection(own, path))?;
        debug!(collection = %path, txn = %tx.id(), "side collection created");
        Ok(())
    }

    // ==================== Queries ====================

    /// Run `expr` against a provider, keeping only nodes of documents
    /// within `scope`. Sees committed state only.
    pub fn query(&self, scope: &CollectionPath, provider: &str, expr: &str) -> DbResult<Vec<NodeRef>> {
        let nodes = self.indexes().query(provider, expr)?;
        Ok(nodes
            .into_iter()
            .filter(|node| node.path.collection.is_within(scope))
            .collect())
    }

    /// Distinct documents matched by `expr` within `scope`.
    pub fn query_documents(&self, scope: &CollectionPath, provider: &str, expr: &str) -> DbResult<Vec<DocumentPath>> {
        let mut paths: Vec<DocumentPath> = self
            .query(scope, provider, expr)?
            .into_iter()
            .map(|node| node.path)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::storage::{Subject, TriggerDef};
    use crate::store::test_support::Harness;
    use crate::trigger::{Outcome, Trigger, TriggerContext, TriggerError};

    fn col(path: &str) -> CollectionPath {
        CollectionPath::new(path).unwrap()
    }

    fn doc(path: &str) -> DocumentPath {
        DocumentPath::parse(path).unwrap()
    }

    /// Logs every hook call; vetoes stores when built with `veto=store`.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        veto_store: bool,
    }

    impl Trigger for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn before(&self, _ctx: &mut TriggerContext<'_>, event: &TriggerEvent) -> Result<Outcome, TriggerError> {
            if self.veto_store && event.kind == OperationKind::Store {
                return Ok(Outcome::Veto("read only".into()));
            }
            self.log.lock().push(format!("before {} {}", event.kind, event.target));
            Ok(Outcome::Continue)
        }

        fn after(&self, _ctx: &mut TriggerContext<'_>, event: &TriggerEvent) -> Result<(), TriggerError> {
            self.log.lock().push(format!("after {} {}", event.kind, event.target));
            Ok(())
        }
    }

    fn with_recorder(h: &Harness) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        h.db.triggers().register("recorder", move |def: &TriggerDef| {
            let trigger = Recorder {
                log: Arc::clone(&shared),
                veto_store: def.params.get("veto").map(String::as_str) == Some("store"),
            };
            Ok(Arc::new(trigger) as Arc<dyn Trigger>)
        });
        log
    }

    fn configure(h: &Harness, path: &str, config: CollectionConfig) {
        let path = col(path);
        h.run(|tx| h.store.configure_collection(tx, &path, Some(config)))
            .unwrap();
    }

    fn names_in(h: &Harness, path: &str) -> Vec<String> {
        let path = col(path);
        h.run(|tx| h.store.list_documents(tx, &path))
            .unwrap()
            .into_iter()
            .map(|d| d.name.into_string())
            .collect()
    }

    #[test]
    fn test_create_collection_with_intermediates() {
        let h = Harness::new();
        let deep = col("/db/x/y/z");
        assert!(h.run(|tx| h.store.create_collection(tx, &deep)).unwrap());
        assert!(!h.run(|tx| h.store.create_collection(tx, &deep)).unwrap());

        for path in ["/db/x", "/db/x/y", "/db/x/y/z"] {
            assert!(h.store.collection_exists(&col(path)).unwrap(), "{}", path);
        }
        let children = h.run(|tx| h.store.list_collections(tx, &col("/db/x"))).unwrap();
        assert_eq!(children, vec![col("/db/x/y")]);
    }

    #[test]
    fn test_overwrite_bumps_version() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a>1</a>");
        h.put("/db/u/a.xml", "<a>2</a>");

        let current = h.store.fetch_document(&doc("/db/u/a.xml")).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(h.content("/db/u/a.xml"), "<a>2</a>");
    }

    #[test]
    fn test_malformed_content_is_rejected() {
        let h = Harness::new();
        h.mkcol("/db/u");
        let path = doc("/db/u/bad.xml");
        let err = h
            .run(|tx| h.store.store(tx, &path.collection, &path.name, Content::xml("<a><b></a>")))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidContent(_)));
        assert!(!h.exists("/db/u/bad.xml"));
    }

    #[test]
    fn test_history_archives_document_replaced_by_copy() {
        let h = Harness::new();
        h.mkcol("/db/test");
        h.mkcol("/db/other");
        configure(
            &h,
            "/db/test",
            CollectionConfig::default().with_trigger(TriggerDef::new("history").on([
                OperationKind::Store,
                OperationKind::Copy,
                OperationKind::Move,
            ])),
        );
        h.put("/db/test/test.xml", "<v>1</v>");
        h.put("/db/other/test.xml", "<v>2</v>");

        let copied = h
            .run(|tx| h.store.copy_document(tx, &doc("/db/other/test.xml"), &col("/db/test"), None))
            .unwrap();
        assert_eq!(copied, doc("/db/test/test.xml"));
        assert_eq!(h.content("/db/test/test.xml"), "<v>2</v>");

        let archived = h
            .run(|tx| h.store.list_documents(tx, &col("/db/history/db/test/test.xml")))
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].content.as_xml(), Some("<v>1</v>"));

        h.put("/db/test/test.xml", "<v>3</v>");
        assert_eq!(names_in(&h, "/db/history/db/test/test.xml").len(), 2);
    }

    #[test]
    fn test_move_fires_once_when_both_sides_inherit_the_trigger() {
        let h = Harness::new();
        let log = with_recorder(&h);
        h.mkcol("/db/src");
        h.mkcol("/db/dst");
        h.put("/db/src/a.xml", "<a/>");
        configure(
            &h,
            "/db",
            CollectionConfig::default().with_trigger(TriggerDef::new("recorder").on([OperationKind::Move])),
        );

        let before = h.store.fetch_document(&doc("/db/src/a.xml")).unwrap();
        let moved = h
            .run(|tx| h.store.move_document(tx, &doc("/db/src/a.xml"), &col("/db/dst"), None))
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["before move document /db/src/a.xml", "after move document /db/src/a.xml"]
        );
        let after = h.store.fetch_document(&moved).unwrap();
        assert_eq!(after.id, before.id);
        assert!(!h.exists("/db/src/a.xml"));
    }

    #[test]
    fn test_copy_gets_fresh_identity() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a/>");
        let name = DocumentName::new("b.xml").unwrap();
        let copy = h
            .run(|tx| h.store.copy_document(tx, &doc("/db/u/a.xml"), &col("/db/u"), Some(&name)))
            .unwrap();

        let original = h.store.fetch_document(&doc("/db/u/a.xml")).unwrap();
        let copied = h.store.fetch_document(&copy).unwrap();
        assert_ne!(original.id, copied.id);
        assert_eq!(copied.content, original.content);

        let err = h
            .run(|tx| h.store.copy_document(tx, &doc("/db/u/a.xml"), &col("/db/u"), None))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[test]
    fn test_abort_discards_document_and_index_entries() {
        let h = Harness::new();
        h.mkcol("/db/u");
        configure(&h, "/db/u", CollectionConfig::default().with_fulltext(["t"]));
        let path = doc("/db/u/a.xml");

        let mut tx = h.manager.begin().unwrap();
        h.store
            .store(&mut tx, &path.collection, &path.name, Content::xml("<a><t>secret</t></a>"))
            .unwrap();
        assert!(h.store.document(&mut tx, &path).is_ok());
        // not visible to queries before commit
        assert!(h.store.query(&col("/db"), "fulltext", "t:secret").unwrap().is_empty());
        tx.abort();

        assert!(!h.exists("/db/u/a.xml"));
        assert!(h.store.query(&col("/db"), "fulltext", "t:secret").unwrap().is_empty());
        assert!(h.store.fetch_document(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn test_write_without_permission_is_denied() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a/>");
        let guest = Subject::new("guest");
        let path = doc("/db/u/b.xml");

        let err = h
            .manager
            .with_transaction_as(guest.clone(), |tx| {
                h.store.store(tx, &path.collection, &path.name, Content::xml("<b/>"))
            })
            .unwrap_err();
        assert!(matches!(err, DbError::PermissionDenied { .. }));

        // mode 755 still lets others read
        let read = h
            .manager
            .with_transaction_as(guest, |tx| h.store.document(tx, &doc("/db/u/a.xml")))
            .unwrap();
        assert_eq!(read.content.as_xml(), Some("<a/>"));
    }

    #[test]
    fn test_veto_rolls_back_only_the_operation() {
        let h = Harness::new();
        let log = with_recorder(&h);
        h.mkcol("/db/ro");
        h.mkcol("/db/rw");
        configure(
            &h,
            "/db/ro",
            CollectionConfig::default().with_trigger(TriggerDef::new("recorder").param("veto", "store")),
        );

        let mut tx = h.manager.begin().unwrap();
        let ok = doc("/db/rw/a.xml");
        h.store.store(&mut tx, &ok.collection, &ok.name, Content::xml("<a/>")).unwrap();
        let blocked = doc("/db/ro/a.xml");
        let err = h
            .store
            .store(&mut tx, &blocked.collection, &blocked.name, Content::xml("<a/>"))
            .unwrap_err();
        assert!(matches!(err, DbError::TriggerRejected { ref reason, .. } if reason == "read only"));
        assert!(tx.is_active());
        tx.commit().unwrap();

        assert!(h.exists("/db/rw/a.xml"));
        assert!(!h.exists("/db/ro/a.xml"));
        assert!(log.lock().iter().all(|line| !line.contains("store")));
    }

    #[test]
    fn test_remove_collection_fires_for_every_document() {
        let h = Harness::new();
        let log = with_recorder(&h);
        h.mkcol("/db/gone/sub");
        h.put("/db/gone/a.xml", "<a><t>alpha</t></a>");
        h.put("/db/gone/b.xml", "<b/>");
        h.put("/db/gone/sub/c.xml", "<c/>");
        configure(
            &h,
            "/db/gone",
            CollectionConfig::default()
                .with_fulltext(["t"])
                .with_trigger(TriggerDef::new("recorder").on([OperationKind::Remove])),
        );
        assert_eq!(h.store.query(&col("/db"), "fulltext", "alpha").unwrap().len(), 1);

        h.run(|tx| h.store.remove(tx, &ResourceRef::Collection(col("/db/gone"))))
            .unwrap();

        let log = log.lock();
        assert_eq!(log.first().map(String::as_str), Some("before remove collection /db/gone"));
        assert_eq!(log.last().map(String::as_str), Some("after remove collection /db/gone"));
        let removed_docs = log
            .iter()
            .filter(|line| line.starts_with("before remove document"))
            .count();
        assert_eq!(removed_docs, 3);

        assert!(!h.store.collection_exists(&col("/db/gone")).unwrap());
        assert!(!h.store.collection_exists(&col("/db/gone/sub")).unwrap());
        assert!(h.store.query(&col("/db"), "fulltext", "alpha").unwrap().is_empty());
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let h = Harness::new();
        let err = h.run(|tx| h.store.remove_collection(tx, &col("/db"))).unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[test]
    fn test_move_collection_keeps_identities_and_index_entries() {
        let h = Harness::new();
        h.mkcol("/db/a/b");
        h.mkcol("/db/dest");
        configure(&h, "/db/a", CollectionConfig::default().with_fulltext(["t"]));
        h.put("/db/a/b/x.xml", "<r><t>hello</t></r>");
        let before = h.store.fetch_document(&doc("/db/a/b/x.xml")).unwrap();

        let target = h
            .run(|tx| h.store.move_collection(tx, &col("/db/a"), &col("/db/dest"), None))
            .unwrap();
        assert_eq!(target, col("/db/dest/a"));
        assert!(!h.store.collection_exists(&col("/db/a")).unwrap());

        let after = h.store.fetch_document(&doc("/db/dest/a/b/x.xml")).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(
            h.store.query_documents(&col("/db"), "fulltext", "t:hello").unwrap(),
            vec![doc("/db/dest/a/b/x.xml")]
        );
        assert!(h.store.tree().config(&col("/db/dest/a")).is_some());
    }

    #[test]
    fn test_move_collection_into_itself_is_refused() {
        let h = Harness::new();
        h.mkcol("/db/a/b");
        let err = h
            .run(|tx| h.store.move_collection(tx, &col("/db/a"), &col("/db/a/b"), None))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));

        h.mkcol("/db/dest/a");
        let err = h
            .run(|tx| h.store.move_collection(tx, &col("/db/a"), &col("/db/dest"), None))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
        assert!(h.store.collection_exists(&col("/db/a/b")).unwrap());
    }

    #[test]
    fn test_copy_collection_duplicates_subtree() {
        let h = Harness::new();
        h.mkcol("/db/a/b");
        configure(&h, "/db/a", CollectionConfig::default().with_fulltext(["t"]));
        h.put("/db/a/b/x.xml", "<r><t>hello</t></r>");

        let target = h
            .run(|tx| h.store.copy_collection(tx, &col("/db/a"), &col("/db"), Some("a2")))
            .unwrap();
        assert_eq!(target, col("/db/a2"));

        let original = h.store.fetch_document(&doc("/db/a/b/x.xml")).unwrap();
        let copy = h.store.fetch_document(&doc("/db/a2/b/x.xml")).unwrap();
        assert_ne!(original.id, copy.id);
        assert_eq!(
            h.store.query_documents(&col("/db"), "fulltext", "t:hello").unwrap(),
            vec![doc("/db/a/b/x.xml"), doc("/db/a2/b/x.xml")]
        );
        assert_eq!(
            h.store.query_documents(&col("/db/a2"), "fulltext", "t:hello").unwrap(),
            vec![doc("/db/a2/b/x.xml")]
        );
    }

    #[test]
    fn test_configure_reindexes_existing_documents() {
        let h = Harness::new();
        h.mkcol("/db/plays");
        h.put("/db/plays/r.xml", "<PLAY><SPEECH><LINE>a horse</LINE></SPEECH></PLAY>");
        assert!(h.store.query(&col("/db"), "fulltext", "horse").unwrap().is_empty());

        configure(
            &h,
            "/db/plays",
            CollectionConfig::default().with_fulltext(["LINE"]).with_structural(Vec::<String>::new()),
        );
        assert_eq!(h.store.query(&col("/db"), "fulltext", "LINE:horse").unwrap().len(), 1);
        assert_eq!(h.store.query(&col("/db"), "structural", "//SPEECH").unwrap().len(), 1);

        let plays = col("/db/plays");
        h.run(|tx| h.store.configure_collection(tx, &plays, None)).unwrap();
        assert!(h.store.query(&col("/db"), "fulltext", "horse").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_trigger_in_config_is_refused() {
        let h = Harness::new();
        h.mkcol("/db/u");
        let path = col("/db/u");
        let config = CollectionConfig::default().with_trigger(TriggerDef::new("nope"));
        let err = h
            .run(|tx| h.store.configure_collection(tx, &path, Some(config)))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(h.store.tree().config(&path).is_none());
    }

    #[test]
    fn test_conflicting_writer_times_out_and_aborts() {
        let h = Harness::new();
        h.mkcol("/db/u");
        let path = doc("/db/u/a.xml");

        let mut first = h.manager.begin().unwrap();
        h.store
            .store(&mut first, &path.collection, &path.name, Content::xml("<a>1</a>"))
            .unwrap();

        let mut second = h.manager.begin().unwrap();
        let err = h
            .store
            .store(&mut second, &path.collection, &path.name, Content::xml("<a>2</a>"))
            .unwrap_err();
        assert!(matches!(err, DbError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(!second.is_active());

        first.commit().unwrap();
        assert_eq!(h.content("/db/u/a.xml"), "<a>1</a>");
    }

    #[test]
    fn test_resolve_paths() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a/>");
        assert_eq!(h.store.resolve("/db/u").unwrap(), ResourceRef::Collection(col("/db/u")));
        assert_eq!(h.store.resolve("/db/u/a.xml").unwrap(), ResourceRef::Document(doc("/db/u/a.xml")));
        assert!(h.store.resolve("/db/u/b.xml").unwrap_err().is_not_found());
    }
}

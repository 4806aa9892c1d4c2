//! Database API - the process-scoped context tying the components together.

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::journal::{replay, FileSink, Journal, JournalError, LogSink, MemorySink};
use crate::index::IndexSet;
use crate::lock::LockManager;
use crate::storage::{CollectionTree, Subject, TreeSnapshot};
use crate::store::CollectionStore;
use crate::transaction::{Transaction, TransactionManager, TxnParticipant};
use crate::trigger::{TriggerPipeline, TriggerRegistry};

/// What a checkpoint writes: the whole tree plus the counters recovery
/// resumes from.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    tree: TreeSnapshot,
    commit_seq: u64,
    last_txn: u64,
    created: DateTime<Utc>,
}

/// The main database handle.
///
/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    config: DatabaseConfig,
    journal: Arc<Journal>,
    tree: Arc<CollectionTree>,
    registry: TriggerRegistry,
    store: CollectionStore,
    transactions: TransactionManager,
}

impl Database {
    /// Open (or create) the database described by `config`.
    pub fn open(config: DatabaseConfig) -> DbResult<Self> {
        let sink: Box<dyn LogSink> = match config.path() {
            Some(dir) => {
                if !dir.exists() {
                    if !config.create_if_missing {
                        return Err(DbError::not_found(format!("database directory {}", dir.display())));
                    }
                    fs::create_dir_all(dir).map_err(JournalError::from)?;
                }
                Box::new(FileSink::open(dir).map_err(JournalError::from)?)
            }
            None => Box::new(MemorySink::new()),
        };
        Self::open_with_sink(config, sink)
    }

    /// A fresh database that keeps its journal in memory.
    pub fn in_memory() -> DbResult<Self> {
        Self::open(DatabaseConfig::in_memory())
    }

    /// Open over an explicit journal sink; `config.path` is ignored.
    pub fn open_with_sink(config: DatabaseConfig, sink: Box<dyn LogSink>) -> DbResult<Self> {
        let journal = Arc::new(Journal::new(sink, config.sync_on_commit));

        let checkpoint = match journal.read_snapshot()? {
            Some(bytes) => Some(serde_json::from_slice::<Checkpoint>(&bytes).map_err(JournalError::from)?),
            None => None,
        };
        let (tree, base_seq, base_txn) = match checkpoint {
            Some(cp) => {
                info!(commit_seq = cp.commit_seq, created = %cp.created, "loading checkpoint");
                (CollectionTree::from_snapshot(cp.tree), cp.commit_seq, cp.last_txn)
            }
            None => (CollectionTree::new(), 0, 0),
        };

        let recovered = replay(journal.read_entries()?);
        let mut replayed = 0;
        for txn in &recovered.committed {
            // left over when a crash hit between snapshot and truncation
            if txn.commit_seq <= base_seq {
                continue;
            }
            for record in &txn.records {
                tree.apply(record)?;
            }
            replayed += 1;
        }
        if !recovered.discarded.is_empty() {
            warn!(count = recovered.discarded.len(), "discarded incomplete transactions");
        }
        journal.set_commit_seq(recovered.last_commit_seq.max(base_seq));

        let tree = Arc::new(tree);
        let indexes = Arc::new(IndexSet::new());
        indexes.rebuild(&tree)?;

        let tree_participant: Arc<dyn TxnParticipant> = tree.clone();
        let index_participant: Arc<dyn TxnParticipant> = indexes.clone();
        let participants = vec![tree_participant, index_participant];
        let transactions =
            TransactionManager::new(Arc::clone(&journal), LockManager::new(), participants, config.lock_timeout);

        let registry = TriggerRegistry::with_builtins(config.history_root.clone());
        let store = CollectionStore::new(
            Arc::clone(&tree),
            indexes,
            TriggerPipeline::new(registry.clone()),
            transactions.clone(),
            config.lock_timeout,
        );

        transactions.resume_after(recovered.max_txn.max(base_txn));

        info!(
            path = ?config.path(),
            replayed,
            commit_seq = journal.commit_seq(),
            collections = tree.collection_count(),
            "database opened"
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                config,
                journal,
                tree,
                registry,
                store,
                transactions,
            }),
        })
    }

    /// Begin a transaction as the system subject.
    pub fn begin(&self) -> DbResult<Transaction> {
        self.inner.transactions.begin()
    }

    pub fn begin_as(&self, subject: Subject) -> DbResult<Transaction> {
        self.inner.transactions.begin_as(subject)
    }

    /// Run `f` in a transaction: committed on `Ok`, aborted on `Err`.
    pub fn with_transaction<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction) -> DbResult<T>,
    {
        self.inner.transactions.with_transaction(f)
    }

    pub fn with_transaction_as<F, T>(&self, subject: Subject, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction) -> DbResult<T>,
    {
        self.inner.transactions.with_transaction_as(subject, f)
    }

    pub fn store(&self) -> &CollectionStore {
        &self.inner.store
    }

    /// Trigger factories; register custom triggers here before configuring
    /// a collection that names them.
    pub fn triggers(&self) -> &TriggerRegistry {
        &self.inner.registry
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Snapshot the tree and truncate the journal.
    ///
    /// Fails with `InvalidState` while any transaction is active.
    pub fn checkpoint(&self) -> DbResult<()> {
        let inner = &self.inner;
        inner.transactions.while_idle(|| {
            let checkpoint = Checkpoint {
                tree: inner.tree.snapshot(),
                commit_seq: inner.journal.commit_seq(),
                last_txn: inner.transactions.next_txn_id().saturating_sub(1),
                created: Utc::now(),
            };
            let bytes = serde_json::to_vec(&checkpoint).map_err(JournalError::from)?;
            inner.journal.checkpoint(&bytes)?;
            info!(
                commit_seq = checkpoint.commit_seq,
                collections = checkpoint.tree.collections.len(),
                "checkpoint written"
            );
            Ok(())
        })
    }

    /// Checkpoint and release this handle.
    pub fn close(self) -> DbResult<()> {
        self.checkpoint()?;
        info!(path = ?self.inner.config.path(), "database closed");
        Ok(())
    }

    /// Get database statistics.
    pub fn stats(&self) -> DatabaseStats {
        let inner = &self.inner;
        let indexes = inner.store.indexes();
        DatabaseStats {
            collections: inner.tree.collection_count(),
            documents: inner.tree.all_documents().len(),
            index_entries: indexes
                .names()
                .into_iter()
                .filter_map(|name| indexes.provider(name))
                .map(|p| p.entry_count())
                .sum(),
            active_transactions: inner.transactions.active_count(),
            commit_seq: inner.journal.commit_seq(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.config.path())
            .field("journal", &self.inner.journal)
            .field("transactions", &self.inner.transactions)
            .finish()
    }
}

/// Database statistics.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub collections: usize,
    pub documents: usize,
    /// Committed entries summed over every index provider.
    pub index_entries: usize,
    pub active_transactions: usize,
    /// Sequence number of the last durable commit.
    pub commit_seq: u64,
}

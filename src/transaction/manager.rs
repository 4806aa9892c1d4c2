//! Transaction manager - coordinates all transaction operations.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Transaction creation and lifecycle
//! - Tracking active transactions
//! - Fanning commit and rollback out to the participants
//! - Quiescing the database for checkpoints

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::journal::{Journal, JournalRecord};
use crate::lock::LockManager;
use crate::storage::Subject;
use crate::transaction::context::{Transaction, TxnId};
use crate::transaction::participant::TxnParticipant;

/// Metadata of an active transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: TxnId,
    pub subject: String,
    pub started_at: DateTime<Utc>,
}

/// Transaction manager - coordinates all transaction operations.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

pub(crate) struct TransactionManagerInner {
    pub(crate) journal: Arc<Journal>,
    pub(crate) locks: LockManager,
    /// Called in order on prepare and commit, in reverse on rollback.
    pub(crate) participants: Vec<Arc<dyn TxnParticipant>>,
    next_txn: AtomicU64,
    /// Active transactions tracked by ID.
    active: RwLock<HashMap<TxnId, TransactionInfo>>,
    pub(crate) lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(
        journal: Arc<Journal>,
        locks: LockManager,
        participants: Vec<Arc<dyn TxnParticipant>>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                journal,
                locks,
                participants,
                next_txn: AtomicU64::new(1),
                active: RwLock::new(HashMap::new()),
                lock_timeout,
            }),
        }
    }

    /// Continue numbering after the highest id found in the journal.
    pub(crate) fn resume_after(&self, last_txn: u64) {
        self.inner.next_txn.fetch_max(last_txn + 1, Ordering::SeqCst);
    }

    /// Next id that will be handed out.
    pub fn next_txn_id(&self) -> u64 {
        self.inner.next_txn.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Begin a transaction as the system subject.
    pub fn begin(&self) -> DbResult<Transaction> {
        self.begin_as(Subject::system())
    }

    /// Begin a transaction on behalf of `subject`.
    pub fn begin_as(&self, subject: Subject) -> DbResult<Transaction> {
        let id = TxnId(self.inner.next_txn.fetch_add(1, Ordering::SeqCst));
        let holder = self.inner.locks.new_holder();

        // checkpoints hold the write side while they run
        let mut active = self.inner.active.write();
        self.inner.journal.append(
            id,
            0,
            JournalRecord::Begin {
                subject: subject.name().to_string(),
            },
        )?;

        let tx = Transaction::new(id, holder, subject, Arc::clone(&self.inner));
        active.insert(
            id,
            TransactionInfo {
                id,
                subject: tx.subject().name().to_string(),
                started_at: tx.started_at(),
            },
        );
        debug!(txn = %id, subject = tx.subject().name(), "transaction started");
        Ok(tx)
    }

    /// Get the number of active transactions.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// List all active transactions, oldest first.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        let mut list: Vec<_> = self.inner.active.read().values().cloned().collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Check if a transaction is active.
    pub fn is_active(&self, id: TxnId) -> bool {
        self.inner.active.read().contains_key(&id)
    }

    /// Run `f` while no transaction is active, keeping new ones from starting.
    pub fn while_idle<T>(&self, f: impl FnOnce() -> DbResult<T>) -> DbResult<T> {
        let active = self.inner.active.write();
        if !active.is_empty() {
            return Err(DbError::invalid_state(format!(
                "{} transaction(s) still active",
                active.len()
            )));
        }
        f()
    }

    /// Execute a function within a transaction, automatically committing or rolling back.
    ///
    /// If the function returns Ok, the transaction is committed.
    /// If the function returns Err or panics, the transaction is rolled back.
    pub fn with_transaction<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction) -> DbResult<T>,
    {
        self.with_transaction_as(Subject::system(), f)
    }

    /// Like [`with_transaction`](Self::with_transaction), on behalf of `subject`.
    pub fn with_transaction_as<F, T>(&self, subject: Subject, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction) -> DbResult<T>,
    {
        let mut tx = self.begin_as(subject)?;

        match f(&mut tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.abort();
                Err(e)
            }
        }
    }
}

impl TransactionManagerInner {
    /// Mark a transaction as completed (committed or aborted).
    pub(crate) fn mark_completed(&self, id: TxnId) {
        self.active.write().remove(&id);
    }
}

// Ensure TransactionManager can be safely shared across threads
impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .finish()
    }
}

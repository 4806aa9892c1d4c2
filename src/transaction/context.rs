//! The transaction context handed to every store operation.
//!
//! A `Transaction` owns its locks and its position in the journal. It ends in
//! exactly one of two ways:
//! - `commit`: participants prepare, the commit marker is synced, participants
//!   publish their staged state, locks are released
//! - `abort` (or drop while active): participants discard staged state, then
//!   locks are released

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{DbError, DbResult};
use crate::journal::JournalRecord;
use crate::lock::{HolderId, LockGuard, LockMode, LockTarget};
use crate::storage::Subject;
use crate::transaction::manager::TransactionManagerInner;

/// Monotonic transaction identity. Id 0 is reserved for index bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Pseudo transaction used to load committed state at startup.
    pub const BOOTSTRAP: TxnId = TxnId(0);
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Active => write!(f, "ACTIVE"),
            TxnState::Committed => write!(f, "COMMITTED"),
            TxnState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Position to roll back to when a single operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    step: u64,
    locks: usize,
}

impl Savepoint {
    pub fn step(&self) -> u64 {
        self.step
    }
}

/// An active unit of work.
pub struct Transaction {
    id: TxnId,
    holder: HolderId,
    subject: Subject,
    state: TxnState,
    next_step: u64,
    locks: Vec<LockGuard>,
    started_at: DateTime<Utc>,
    /// Trigger instances currently executing inside this transaction.
    firing: HashSet<String>,
    manager: Arc<TransactionManagerInner>,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        holder: HolderId,
        subject: Subject,
        manager: Arc<TransactionManagerInner>,
    ) -> Self {
        Self {
            id,
            holder,
            subject,
            state: TxnState::Active,
            next_step: 1,
            locks: Vec::new(),
            started_at: Utc::now(),
            firing: HashSet::new(),
            manager,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn lock_timeout(&self) -> Duration {
        self.manager.lock_timeout
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Fails with `InvalidState` unless the transaction is still active.
    pub fn ensure_active(&self) -> DbResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DbError::invalid_state(format!(
                "transaction {} is no longer active (state: {})",
                self.id, self.state
            )))
        }
    }

    /// Allocate the step number for the next staged change.
    pub(crate) fn next_step(&mut self) -> u64 {
        let step = self.next_step;
        self.next_step += 1;
        step
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            step: self.next_step,
            locks: self.locks.len(),
        }
    }

    /// Undo every change made since `savepoint` and release the locks taken
    /// after it. The transaction stays active.
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        self.ensure_active()?;
        for participant in self.manager.participants.iter().rev() {
            participant.rollback(self.id, savepoint.step);
        }
        self.log(0, JournalRecord::RollbackTo { step: savepoint.step })?;
        self.locks.truncate(savepoint.locks);
        Ok(())
    }

    /// Append a record to the journal under this transaction.
    pub(crate) fn log(&self, step: u64, record: JournalRecord) -> DbResult<()> {
        self.manager.journal.append(self.id, step, record)?;
        Ok(())
    }

    /// Acquire a lock held until the transaction ends.
    pub fn lock(&mut self, target: LockTarget, mode: LockMode) -> DbResult<()> {
        self.ensure_active()?;
        let guard = self
            .manager
            .locks
            .acquire(target, mode, self.holder, self.lock_timeout())?;
        self.locks.push(guard);
        Ok(())
    }

    /// Acquire several locks in the global order.
    pub fn lock_all(
        &mut self,
        targets: impl IntoIterator<Item = (LockTarget, LockMode)>,
    ) -> DbResult<()> {
        self.ensure_active()?;
        let guards = self
            .manager
            .locks
            .acquire_all(targets, self.holder, self.lock_timeout())?;
        self.locks.extend(guards);
        Ok(())
    }

    /// Acquire a lock, failing with `InvalidState` if `alive` reports the
    /// target gone once the lock is granted.
    pub fn lock_checked(
        &mut self,
        target: LockTarget,
        mode: LockMode,
        alive: impl FnOnce(&LockTarget) -> bool,
    ) -> DbResult<()> {
        self.ensure_active()?;
        let guard = self.manager.locks.acquire_checked(
            target,
            mode,
            self.holder,
            self.lock_timeout(),
            alive,
        )?;
        self.locks.push(guard);
        Ok(())
    }

    /// Number of lock acquisitions currently held.
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Mark a trigger instance as executing. Returns false if it already is.
    pub(crate) fn enter_trigger(&mut self, key: &str) -> bool {
        self.firing.insert(key.to_string())
    }

    pub(crate) fn leave_trigger(&mut self, key: &str) {
        self.firing.remove(key);
    }

    /// Commit the transaction and return its commit sequence number.
    pub fn commit(mut self) -> DbResult<u64> {
        self.ensure_active()?;
        let manager = Arc::clone(&self.manager);

        for participant in &manager.participants {
            if let Err(e) = participant.prepare(self.id) {
                warn!(txn = %self.id, participant = participant.name(), error = %e, "prepare failed");
                self.abort_in_place();
                return Err(e);
            }
        }

        let seq = match manager.journal.commit(self.id) {
            Ok(seq) => seq,
            Err(e) => {
                error!(txn = %self.id, error = %e, "commit marker not durable, aborting");
                self.abort_in_place();
                return Err(DbError::IoFailure(e));
            }
        };

        for participant in &manager.participants {
            participant.commit(self.id);
        }

        self.state = TxnState::Committed;
        self.locks.clear();
        manager.mark_completed(self.id);
        info!(txn = %self.id, commit_seq = seq, "transaction committed");
        Ok(seq)
    }

    /// Discard every effect of the transaction.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    pub(crate) fn abort_in_place(&mut self) {
        if self.state != TxnState::Active {
            return;
        }

        self.manager.journal.abort(self.id);
        for participant in self.manager.participants.iter().rev() {
            participant.rollback(self.id, 0);
        }

        self.state = TxnState::Aborted;
        self.locks.clear();
        self.firing.clear();
        self.manager.mark_completed(self.id);
        info!(txn = %self.id, "transaction aborted");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            warn!(txn = %self.id, "transaction dropped while active, aborting");
            self.abort_in_place();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("subject", &self.subject.name())
            .field("locks", &self.locks.len())
            .finish()
    }
}

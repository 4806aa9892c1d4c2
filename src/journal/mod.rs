//! Durable append-only journal.
//!
//! Every structural change made by a transaction is appended as one JSON line
//! `{txn, step, record}`. A transaction becomes durable when its `Commit`
//! marker is written and synced; recovery replays committed transactions in
//! commit order and ignores everything else. A commit marker followed by an
//! abort marker for the same transaction is a commit whose sync failed and
//! does not count.
//!
//! ```text
//! {"txn":4,"step":0,"record":{"op":"begin","subject":"SYSTEM"}}
//! {"txn":4,"step":1,"record":{"op":"create_collection",...}}
//! {"txn":4,"step":2,"record":{"op":"store_document",...}}
//! {"txn":4,"step":0,"record":{"op":"commit","commit_seq":12}}
//! ```
//!
//! A checkpoint writes a full tree snapshot, then truncates the log.

mod error;
mod record;
pub mod recovery;
mod sink;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use error::{JournalError, JournalResult};
pub use record::{JournalEntry, JournalRecord};
pub use recovery::{replay, CommittedTxn, RecoveredLog};
pub use sink::{FileSink, LogSink, MemorySink, LOG_FILE, SNAPSHOT_FILE};

use crate::transaction::TxnId;

/// The journal shared by every transaction of a database.
pub struct Journal {
    sink: Mutex<Box<dyn LogSink>>,
    commit_seq: AtomicU64,
    sync_on_commit: bool,
}

impl Journal {
    pub fn new(sink: Box<dyn LogSink>, sync_on_commit: bool) -> Self {
        Self {
            sink: Mutex::new(sink),
            commit_seq: AtomicU64::new(0),
            sync_on_commit,
        }
    }

    /// Append one record. Not durable until the owning transaction commits.
    pub fn append(&self, txn: TxnId, step: u64, record: JournalRecord) -> JournalResult<()> {
        let line = encode(&JournalEntry::new(txn, step, record))?;
        self.sink.lock().append(&line)?;
        Ok(())
    }

    /// Write the commit marker for `txn` and make it durable.
    ///
    /// Commit sequence numbers follow the order of markers in the log. A
    /// number is consumed even when the commit fails, so it is never handed
    /// out twice. If the marker reached the log but could not be made
    /// durable, an abort marker is appended right behind it.
    pub fn commit(&self, txn: TxnId) -> JournalResult<u64> {
        let mut sink = self.sink.lock();
        let seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let line = encode(&JournalEntry::new(txn, 0, JournalRecord::Commit { commit_seq: seq }))?;

        sink.append(&line)?;
        let durable = if self.sync_on_commit {
            sink.sync()
        } else {
            sink.flush()
        };
        if let Err(e) = durable {
            let abort = encode(&JournalEntry::new(txn, 0, JournalRecord::Abort))?;
            if let Err(abort_err) = sink.append(&abort).and_then(|_| sink.flush()) {
                warn!(%txn, error = %abort_err, "could not cancel commit marker");
            }
            return Err(e.into());
        }

        debug!(%txn, commit_seq = seq, "commit marker written");
        Ok(seq)
    }

    /// Write the abort marker. Failures are logged, not returned: an
    /// incomplete transaction is discarded by recovery anyway.
    pub fn abort(&self, txn: TxnId) {
        let result = encode(&JournalEntry::new(txn, 0, JournalRecord::Abort)).and_then(|line| {
            let mut sink = self.sink.lock();
            sink.append(&line)
                .and_then(|_| sink.flush())
                .map_err(JournalError::from)
        });
        if let Err(e) = result {
            warn!(%txn, error = %e, "could not write abort marker");
        }
    }

    /// Last assigned commit sequence number.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn set_commit_seq(&self, seq: u64) {
        self.commit_seq.store(seq, Ordering::SeqCst);
    }

    /// Parse the whole log.
    ///
    /// A damaged final line is a torn write and is skipped; damage anywhere
    /// else is reported as corruption.
    pub fn read_entries(&self) -> JournalResult<Vec<JournalEntry>> {
        let bytes = self.sink.lock().read_log()?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

        let mut entries = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if idx + 1 == lines.len() => {
                    warn!(line = idx + 1, error = %e, "ignoring torn journal tail");
                }
                Err(e) => {
                    return Err(JournalError::Corrupt {
                        line: idx + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }

    pub fn read_snapshot(&self) -> JournalResult<Option<Vec<u8>>> {
        Ok(self.sink.lock().read_snapshot()?)
    }

    /// Persist `snapshot` and drop the log it supersedes.
    ///
    /// The caller guarantees no transaction is active.
    pub fn checkpoint(&self, snapshot: &[u8]) -> JournalResult<()> {
        let mut sink = self.sink.lock();
        sink.write_snapshot(snapshot)?;
        sink.truncate_log()?;
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("commit_seq", &self.commit_seq())
            .field("sync_on_commit", &self.sync_on_commit)
            .finish()
    }
}

fn encode(entry: &JournalEntry) -> JournalResult<Vec<u8>> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    Ok(line)
}

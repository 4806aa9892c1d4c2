//! Replay of the journal after restart.

use std::collections::HashMap;

use crate::journal::record::{JournalEntry, JournalRecord};
use crate::transaction::TxnId;

/// A transaction whose commit marker reached the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTxn {
    pub commit_seq: u64,
    pub txn: TxnId,
    /// Structural records, with rolled-back steps already removed.
    pub records: Vec<JournalRecord>,
}

/// Outcome of scanning the log.
#[derive(Debug, Default)]
pub struct RecoveredLog {
    /// In commit order.
    pub committed: Vec<CommittedTxn>,
    /// Transactions that aborted or never reached a commit marker.
    pub discarded: Vec<TxnId>,
    pub last_commit_seq: u64,
    pub max_txn: u64,
}

/// Group entries by transaction and keep the ones that committed.
///
/// An abort marker after a commit marker cancels the commit: it is written
/// when the commit marker could not be made durable.
pub fn replay(entries: impl IntoIterator<Item = JournalEntry>) -> RecoveredLog {
    let mut open: HashMap<TxnId, Vec<(u64, JournalRecord)>> = HashMap::new();
    let mut committed: HashMap<TxnId, CommittedTxn> = HashMap::new();
    let mut out = RecoveredLog::default();

    for entry in entries {
        out.max_txn = out.max_txn.max(entry.txn.0);

        match entry.record {
            JournalRecord::Begin { .. } => {
                open.entry(entry.txn).or_default();
            }
            JournalRecord::RollbackTo { step } => {
                if let Some(records) = open.get_mut(&entry.txn) {
                    records.retain(|(s, _)| *s < step);
                }
            }
            JournalRecord::Commit { commit_seq } => {
                let records = open.remove(&entry.txn).unwrap_or_default();
                out.last_commit_seq = out.last_commit_seq.max(commit_seq);
                committed.insert(
                    entry.txn,
                    CommittedTxn {
                        commit_seq,
                        txn: entry.txn,
                        records: records.into_iter().map(|(_, r)| r).collect(),
                    },
                );
            }
            JournalRecord::Abort => {
                open.remove(&entry.txn);
                committed.remove(&entry.txn);
                out.discarded.push(entry.txn);
            }
            record => {
                open.entry(entry.txn).or_default().push((entry.step, record));
            }
        }
    }

    out.discarded.extend(open.into_keys());
    out.discarded.sort();
    out.discarded.dedup();
    out.committed = committed.into_values().collect();
    out.committed.sort_by_key(|c| c.commit_seq);
    out
}

//! Journal record definitions.

use serde::{Deserialize, Serialize};

use crate::storage::{CollectionConfig, CollectionPath, Document, DocumentName, Permissions};
use crate::transaction::TxnId;

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub txn: TxnId,
    /// Step within the transaction; 0 for transaction markers.
    pub step: u64,
    pub record: JournalRecord,
}

impl JournalEntry {
    pub fn new(txn: TxnId, step: u64, record: JournalRecord) -> Self {
        Self { txn, step, record }
    }
}

/// A structural change or a transaction marker.
///
/// Structural records carry complete after-images, so replaying a committed
/// transaction never needs the state that preceded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Begin {
        subject: String,
    },
    CreateCollection {
        path: CollectionPath,
        permissions: Permissions,
    },
    RemoveCollection {
        path: CollectionPath,
    },
    StoreDocument {
        collection: CollectionPath,
        document: Document,
    },
    RemoveDocument {
        collection: CollectionPath,
        name: DocumentName,
    },
    /// Relocate a whole subtree, documents included.
    MoveCollection {
        from: CollectionPath,
        to: CollectionPath,
    },
    Configure {
        path: CollectionPath,
        config: Option<CollectionConfig>,
    },
    /// Discard every earlier record of the transaction with `step >= self.step`.
    RollbackTo {
        step: u64,
    },
    Commit {
        commit_seq: u64,
    },
    Abort,
}

impl JournalRecord {
    /// Records that end a transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JournalRecord::Commit { .. } | JournalRecord::Abort)
    }

    /// Records that change the collection tree when replayed.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            JournalRecord::Begin { .. }
                | JournalRecord::RollbackTo { .. }
                | JournalRecord::Commit { .. }
                | JournalRecord::Abort
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_format() {
        let entry = JournalEntry::new(
            TxnId(7),
            3,
            JournalRecord::RemoveCollection {
                path: CollectionPath::new("/db/a").unwrap(),
            },
        );
        let line = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            line,
            r#"{"txn":7,"step":3,"record":{"op":"remove_collection","path":"/db/a"}}"#
        );
        assert_eq!(serde_json::from_str::<JournalEntry>(&line).unwrap(), entry);
    }

    #[test]
    fn test_record_classes() {
        assert!(JournalRecord::Abort.is_terminal());
        assert!(JournalRecord::Commit { commit_seq: 1 }.is_terminal());
        assert!(!JournalRecord::RollbackTo { step: 2 }.is_structural());
        assert!(JournalRecord::MoveCollection {
            from: CollectionPath::new("/db/a").unwrap(),
            to: CollectionPath::new("/db/b").unwrap(),
        }
        .is_structural());
    }
}

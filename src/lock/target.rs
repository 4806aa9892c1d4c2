//! Lock targets, modes and holders.

use std::cmp::Ordering;
use std::fmt;

use crate::storage::{CollectionPath, DocumentPath};

/// Lock mode for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
}

impl LockMode {
    /// Returns the stronger of two lock modes.
    pub fn stronger(self, other: LockMode) -> LockMode {
        match (self, other) {
            (LockMode::Read, LockMode::Read) => LockMode::Read,
            _ => LockMode::Write,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "READ"),
            LockMode::Write => write!(f, "WRITE"),
        }
    }
}

/// Identity of a lock holder: a transaction or an ambient caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(pub u64);

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder-{}", self.0)
    }
}

/// A lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Collection(CollectionPath),
    Document(DocumentPath),
}

impl LockTarget {
    pub fn collection(path: &CollectionPath) -> Self {
        LockTarget::Collection(path.clone())
    }

    pub fn document(path: &DocumentPath) -> Self {
        LockTarget::Document(path.clone())
    }

    /// Ordering key: every path segment, then a rank putting a collection
    /// ahead of a document with the same segments.
    fn sort_key(&self) -> (Vec<&str>, u8) {
        match self {
            LockTarget::Collection(path) => (path.components().collect(), 0),
            LockTarget::Document(path) => {
                let mut segments: Vec<&str> = path.collection.components().collect();
                segments.push(path.name.as_str());
                (segments, 1)
            }
        }
    }
}

impl Ord for LockTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for LockTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Collection(path) => write!(f, "collection {}", path),
            LockTarget::Document(path) => write!(f, "document {}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(p: &str) -> LockTarget {
        LockTarget::Collection(CollectionPath::new(p).unwrap())
    }

    fn doc(p: &str) -> LockTarget {
        LockTarget::Document(DocumentPath::parse(p).unwrap())
    }

    #[test]
    fn test_parent_before_child() {
        let mut targets = vec![doc("/db/a/x.xml"), col("/db/b"), col("/db/a/sub"), col("/db/a"), col("/db")];
        targets.sort();
        let rendered: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "collection /db",
                "collection /db/a",
                "collection /db/a/sub",
                "document /db/a/x.xml",
                "collection /db/b",
            ]
        );
    }

    #[test]
    fn test_stronger_mode() {
        assert_eq!(LockMode::Read.stronger(LockMode::Read), LockMode::Read);
        assert_eq!(LockMode::Read.stronger(LockMode::Write), LockMode::Write);
        assert_eq!(LockMode::Write.stronger(LockMode::Read), LockMode::Write);
    }
}

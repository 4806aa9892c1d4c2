//! Database configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::CollectionPath;

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the journal and snapshot. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Create the directory if it doesn't exist.
    pub create_if_missing: bool,
    /// How long a lock request waits before the transaction gives up.
    pub lock_timeout: Duration,
    /// `sync_data` the journal on every commit instead of just flushing it.
    pub sync_on_commit: bool,
    /// Where the history trigger archives replaced documents.
    pub history_root: CollectionPath,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            lock_timeout: Duration::from_secs(30),
            sync_on_commit: true,
            history_root: CollectionPath::history(),
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration for the database directory at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Configuration for a database that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    pub fn history_root(mut self, root: CollectionPath) -> Self {
        self.history_root = root;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert!(config.is_in_memory());
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.history_root.as_str(), "/db/history");
    }

    #[test]
    fn test_builder() {
        let config = DatabaseConfig::new("/tmp/xmldb")
            .create_if_missing(false)
            .lock_timeout(Duration::from_millis(250))
            .sync_on_commit(false);
        assert_eq!(config.path(), Some(Path::new("/tmp/xmldb")));
        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
    }
}

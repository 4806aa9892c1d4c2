//! journal error types

use thiserror::Error;

/// Errors raised while writing or reading the durable log.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error against the log or snapshot file
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    /// a record could not be encoded or decoded
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// the log contains a damaged record that is not the torn tail
    #[error("journal corrupted at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

//! Crate-level error type.
//!
//! Component errors (`LockError`, `JournalError`, `IndexError`, ...) convert
//! into [`DbError`], whose variants are the failure kinds every public store
//! operation reports.

use thiserror::Error;

use crate::index::xml::XmlError;
use crate::index::IndexError;
use crate::journal::JournalError;
use crate::lock::LockError;
use crate::storage::{InvalidNameError, StorageError};

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced by the store and transaction layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// The target collection, document or provider does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller lacks rights on the target.
    #[error("permission denied: {subject} has no {access} access to {target}")]
    PermissionDenied {
        subject: String,
        access: String,
        target: String,
    },

    /// A lock could not be obtained within the caller's bound.
    #[error("lock timeout on {target} after {waited_ms}ms")]
    LockTimeout { target: String, waited_ms: u64 },

    /// A before-hook vetoed the operation, or a hook failed.
    #[error("trigger '{trigger}' rejected the operation: {reason}")]
    TriggerRejected { trigger: String, reason: String },

    /// The durable log could not be written.
    #[error("durability failure: {0}")]
    IoFailure(#[from] JournalError),

    /// An index provider could not apply a mutation.
    #[error("index '{provider}' inconsistent: {reason}")]
    IndexInconsistency { provider: String, reason: String },

    /// Transaction not active, or target changed underneath the caller.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed collection or document name.
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// XML content is not well-formed.
    #[error("invalid content: {0}")]
    InvalidContent(#[from] XmlError),

    /// An index query expression could not be parsed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl DbError {
    /// check if this error indicates the target doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    /// Errors that abort the whole enclosing transaction rather than just
    /// the failed operation.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            DbError::LockTimeout { .. } | DbError::IoFailure(_) | DbError::IndexInconsistency { .. }
        )
    }

    /// check if retrying the transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. })
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        DbError::NotFound(what.to_string())
    }

    pub(crate) fn invalid_state(what: impl Into<String>) -> Self {
        DbError::InvalidState(what.into())
    }
}

impl From<LockError> for DbError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { target, waited_ms, .. } => DbError::LockTimeout { target, waited_ms },
            LockError::InvalidState(msg) => DbError::InvalidState(msg),
        }
    }
}

impl From<StorageError> for DbError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            DbError::NotFound(err.to_string())
        } else {
            DbError::InvalidState(err.to_string())
        }
    }
}

impl From<IndexError> for DbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Inconsistency { provider, reason } => {
                DbError::IndexInconsistency { provider, reason }
            }
            IndexError::Query(msg) => DbError::InvalidQuery(msg),
            IndexError::UnknownProvider(name) => DbError::NotFound(format!("index provider '{}'", name)),
        }
    }
}

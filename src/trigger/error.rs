//! Trigger error types.

use thiserror::Error;

use crate::error::DbError;

/// Errors raised by trigger hooks and factories.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The hook failed for a reason of its own.
    #[error("{0}")]
    Failed(String),

    /// A store operation performed by the hook failed.
    #[error("{0}")]
    Store(Box<DbError>),

    /// No factory is registered under this identifier.
    #[error("unknown trigger '{0}'")]
    Unknown(String),

    /// A registration carries parameters the factory rejects.
    #[error("invalid configuration for trigger '{trigger}': {reason}")]
    Config { trigger: String, reason: String },
}

impl From<DbError> for TriggerError {
    fn from(err: DbError) -> Self {
        TriggerError::Store(Box::new(err))
    }
}

//! Lock manager error types.

use std::time::Duration;

use thiserror::Error;

use crate::lock::target::LockMode;

/// Errors that can occur while acquiring a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was not granted within the bound.
    #[error("timed out after {waited_ms}ms waiting for {mode} lock on {target}")]
    Timeout {
        target: String,
        mode: LockMode,
        waited_ms: u64,
    },

    /// The target disappeared while the caller was waiting.
    #[error("{0}")]
    InvalidState(String),
}

impl LockError {
    pub(crate) fn timeout(target: impl ToString, mode: LockMode, waited: Duration) -> Self {
        LockError::Timeout {
            target: target.to_string(),
            mode,
            waited_ms: waited.as_millis() as u64,
        }
    }
}

//! Index error types.

use thiserror::Error;

/// Errors raised by index providers.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The provider was told about a mutation it cannot apply.
    #[error("index '{provider}' inconsistent: {reason}")]
    Inconsistency { provider: String, reason: String },

    /// The query expression is malformed.
    #[error("invalid query: {0}")]
    Query(String),

    /// No provider with this name.
    #[error("unknown index provider '{0}'")]
    UnknownProvider(String),
}

impl IndexError {
    pub(crate) fn inconsistency(provider: &str, reason: impl Into<String>) -> Self {
        IndexError::Inconsistency {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }
}

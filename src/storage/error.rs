//! Storage layer error types
//!
//! Errors raised by the collection tree itself. The store converts them into
//! [`DbError`](crate::error::DbError) kinds.

use thiserror::Error;

use crate::storage::types::{CollectionPath, DocumentPath};

/// the main error type for collection tree operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// the requested collection was not found
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionPath),

    /// the requested document was not found
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentPath),

    /// the collection already exists
    #[error("collection already exists: {0}")]
    CollectionExists(CollectionPath),

    /// a collection still has children or documents
    #[error("collection not empty: {0}")]
    NotEmpty(CollectionPath),

    /// the root collection cannot be removed or moved
    #[error("operation not permitted on the root collection")]
    RootCollection,

    /// a collection cannot be moved into its own subtree
    #[error("cannot move {from} into its own subtree at {to}")]
    MoveIntoSelf { from: CollectionPath, to: CollectionPath },
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::CollectionNotFound(_) | StorageError::DocumentNotFound(_)
        )
    }

    /// check if this error is a conflict with existing state
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::CollectionExists(_) | StorageError::NotEmpty(_) | StorageError::MoveIntoSelf { .. }
        )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

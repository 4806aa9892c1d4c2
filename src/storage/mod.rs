//! storage layer for the collection tree
//!
//! this module holds the data model: names and paths, documents, permissions,
//! per-collection configuration, and the in-memory tree those live in.
//! The upper layers (store, index providers, triggers) read and stage changes
//! through [`CollectionTree`] and never touch node maps directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CollectionTree                          │
//! │     (nodes by path, staged mutations, undo per txn)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  document   │       │ permission  │       │   config    │
//!  │  (content)  │       │ (unix mode) │       │ (triggers,  │
//!  │             │       │             │       │  indexes)   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!  ```

mod config;
mod document;
mod error;
mod permission;
mod tree;
mod types;

// Re-export public API
pub use config::{CollectionConfig, FullTextDefinition, IndexConfig, StructuralDefinition, TriggerDef};
pub use document::{Content, Document, BINARY_MIME, XML_MIME};
pub use error::{StorageError, StorageResult};
pub use permission::{Access, Permissions, Subject, DBA_GROUP};
pub use tree::{CollectionNode, CollectionTree, TreeSnapshot};
pub use types::{CollectionPath, DocumentId, DocumentName, DocumentPath, InvalidNameError};

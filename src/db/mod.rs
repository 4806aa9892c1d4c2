//! The database context.
//!
//! [`Database`] owns one instance of every component (journal, collection
//! tree, index providers, trigger registry, lock manager, transaction
//! manager) and wires them together on open, after recovering the tree from
//! the last checkpoint and the committed tail of the journal.

mod api;
mod config;

pub use api::{Database, DatabaseStats};
pub use config::DatabaseConfig;

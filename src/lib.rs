//! xmldb - a transactional XML collection/document store
//!
//! Documents live in a hierarchical tree of collections rooted at `/db`.
//! Every structural change runs inside a [`Transaction`](transaction::Transaction)
//! that locks what it touches in a global order, fires the before/after
//! triggers configured on the affected collections, and keeps the secondary
//! indexes in step with the tree. A commit is durable once its marker is in
//! the journal.
//!
//! # Example
//!
//! ```no_run
//! use xmldb::db::{Database, DatabaseConfig};
//! use xmldb::storage::{CollectionPath, Content, DocumentName};
//!
//! let db = Database::open(DatabaseConfig::new("./my_database")).unwrap();
//! let plays = CollectionPath::new("/db/plays").unwrap();
//! let name = DocumentName::new("hamlet.xml").unwrap();
//! db.with_transaction(|tx| {
//!     db.store().create_collection(tx, &plays)?;
//!     db.store().store(tx, &plays, &name, Content::xml("<PLAY/>"))
//! })
//! .unwrap();
//! ```

pub mod db;
pub mod error;
pub mod index;
pub mod journal;
pub mod lock;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod trigger;

pub use db::{Database, DatabaseConfig};
pub use error::{DbError, DbResult};

//! The collection/document store.
//!
//! Every public operation follows the same protocol inside the caller's
//! transaction:
//!
//! 1. acquire its locks in the global order
//! 2. check permissions against the locked state
//! 3. resolve the triggers and fire their before-hooks
//! 4. stage the structural change (tree, journal, index providers)
//! 5. fire the after-hooks
//!
//! If any step fails the transaction is rolled back to where the operation
//! began, or aborted outright for lock timeouts, I/O failures and index
//! inconsistencies.

mod engine;
mod ops;
mod update;

pub use engine::CollectionStore;
pub use ops::ResourceRef;
pub use update::{UpdateDelta, UpdateOp, UpdateSummary};

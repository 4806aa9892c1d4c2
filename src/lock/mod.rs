//! Lock management for collections and documents.
//!
//! Locks are granted on [`LockTarget`]s in [`LockMode::Read`] (shared) or
//! [`LockMode::Write`] (exclusive) mode to a [`HolderId`]: a transaction or
//! an ambient caller.
//!
//! # Compatibility
//!
//! ```text
//!          │ Read │ Write │
//! ─────────┼──────┼───────┤
//!   Read   │  ✓   │  ✗    │
//!   Write  │  ✗   │  ✗    │
//! ```
//!
//! Acquisition is reentrant per holder. A holder that is the only holder of
//! a target may upgrade Read to Write; a holder never loses Write while a
//! Write acquisition is outstanding.
//!
//! # Ordering
//!
//! Operations that touch several targets acquire them in the total order of
//! [`LockTarget`] (component-wise path order, parent before child), which
//! [`LockManager::acquire_all`] does for the caller. Waits are bounded; a
//! wait that runs out fails with a timeout instead of deadlocking.

mod error;
mod manager;
mod target;

pub use error::LockError;
pub use manager::{LockGuard, LockManager, LockStatsSnapshot};
pub use target::{HolderId, LockMode, LockTarget};

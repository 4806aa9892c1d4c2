//! Transaction management.
//!
//! A transaction is a bounded unit of work over the collection tree. Changes
//! are applied to the tree under WRITE locks and staged in every participant
//! (the tree's undo log, the index providers' pending entries); the commit
//! marker in the journal is the single durability point.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │     (ids, active set, participants, checkpoint quiesce)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │   Journal   │       │    Lock     │
//!  │  (Context)  │       │  (durable)  │       │   Manager   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut tx = manager.begin()?;
//! store.store(&mut tx, &collection, &name, content)?;
//! tx.commit()?;  // or tx.abort(), or just drop it
//! ```

mod context;
mod manager;
mod participant;

pub use context::{Savepoint, Transaction, TxnId, TxnState};
pub use manager::{TransactionInfo, TransactionManager};
pub use participant::TxnParticipant;

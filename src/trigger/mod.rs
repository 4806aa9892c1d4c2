//! Before/after hooks around structural operations.
//!
//! Collections name the triggers that apply to their subtree in their
//! configuration; a [`TriggerRegistry`] maps those names to factories. For
//! every operation the [`TriggerPipeline`] resolves the applicable triggers
//! (root-declared first) and wraps the mutation in a [`TriggerOperation`]:
//!
//! ```text
//! Preparing ─► BeforeFired ─► Applying ─► AfterFired ─► Done
//!     │              │            │            │
//!     └──────────────┴────────────┴────────────┴──────► Aborted
//! ```
//!
//! A veto or a failing hook aborts the operation with `TriggerRejected`; the
//! store then rolls the transaction back to where the operation began.

mod error;
mod event;
mod history;
mod pipeline;
mod registry;

pub use error::TriggerError;
pub use event::{OperationKind, TriggerEvent, TriggerTarget};
pub use history::HistoryTrigger;
pub use pipeline::{Phase, ResolvedTrigger, TriggerOperation, TriggerPipeline};
pub use registry::{TriggerFactory, TriggerRegistry};

use crate::storage::CollectionPath;
use crate::store::CollectionStore;
use crate::transaction::Transaction;

/// What a before-hook decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Veto(String),
}

/// Everything a hook may use. Store calls made through it join the
/// operation's transaction.
pub struct TriggerContext<'a> {
    pub store: &'a CollectionStore,
    pub tx: &'a mut Transaction,
    /// Collection whose configuration registered the trigger.
    pub declared_on: &'a CollectionPath,
}

/// A hook implementation.
///
/// After-hooks may be delivered again if the transaction is retried, so they
/// must tolerate seeing the same event twice.
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    fn before(&self, _ctx: &mut TriggerContext<'_>, _event: &TriggerEvent) -> Result<Outcome, TriggerError> {
        Ok(Outcome::Continue)
    }

    fn after(&self, _ctx: &mut TriggerContext<'_>, _event: &TriggerEvent) -> Result<(), TriggerError> {
        Ok(())
    }
}

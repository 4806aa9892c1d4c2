//! Components whose staged state follows transaction outcomes.

use crate::error::DbResult;
use crate::transaction::context::TxnId;

/// A component that stages changes per transaction.
///
/// Changes are tagged with the step that made them, so a participant can
/// discard a suffix of a transaction (`rollback` with `from_step > 0`) as well
/// as the whole transaction (`from_step == 0`).
pub trait TxnParticipant: Send + Sync {
    fn name(&self) -> &str;

    /// Last chance to refuse the commit. Nothing has been made durable yet.
    fn prepare(&self, _txn: TxnId) -> DbResult<()> {
        Ok(())
    }

    /// The commit marker is durable; make the staged state permanent.
    fn commit(&self, txn: TxnId);

    /// Undo every change staged at `from_step` or later.
    fn rollback(&self, txn: TxnId, from_step: u64);
}

#![forbid(unsafe_code)]

use recount_kernel_contracts::slot::{SlotLedgerAction, SlotRecordId, SlotStatus};

/// What changed on a slot after a write was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotNotice {
    pub record_id: SlotRecordId,
    pub action: SlotLedgerAction,
    pub status: SlotStatus,
    pub may_advance: bool,
    pub finalized: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Downstream hook for committed slot changes. Delivery is best-effort: a failure never
/// undoes or fails the write that triggered it.
pub trait SlotNotifier: Send + Sync {
    fn slot_changed(&self, notice: &SlotNotice) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl SlotNotifier for NoopNotifier {
    fn slot_changed(&self, _notice: &SlotNotice) -> Result<(), NotifyError> {
        Ok(())
    }
}

#![forbid(unsafe_code)]

use recount_kernel_contracts::count::{CountRefusal, FinalizeRequest};
use recount_kernel_contracts::slot::SlotRecord;
use recount_kernel_contracts::ReasonCodeId;

use crate::EngineError;

pub mod reason_codes {
    use recount_kernel_contracts::ReasonCodeId;

    pub const SEAL_APPLIED: ReasonCodeId = ReasonCodeId(0x5EA1_0001);
    pub const SEAL_ALREADY_APPLIED: ReasonCodeId = ReasonCodeId(0x5EA1_0002);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealDecision {
    pub record: SlotRecord,
    pub changed: bool,
    pub reason_code: ReasonCodeId,
}

/// Administrative seal. Allowed from any status; keeps whatever final value exists.
#[derive(Debug, Default, Clone)]
pub struct SealRuntime;

impl SealRuntime {
    pub fn evaluate(
        &self,
        record: &SlotRecord,
        req: &FinalizeRequest,
    ) -> Result<SealDecision, EngineError> {
        if !req.actor.role.is_privileged() {
            return Err(CountRefusal::NotAuthorized {
                reason: "finalize requires a privileged actor",
            }
            .into());
        }
        if record.finalized {
            return Ok(SealDecision {
                record: record.clone(),
                changed: false,
                reason_code: reason_codes::SEAL_ALREADY_APPLIED,
            });
        }
        let mut next = record.clone();
        next.finalized = true;
        next.finalized_at = Some(req.now);
        next.finalized_by = Some(req.actor.actor_id.clone());
        next.may_advance = false;
        Ok(SealDecision {
            record: next,
            changed: true,
            reason_code: reason_codes::SEAL_APPLIED,
        })
    }
}

#![forbid(unsafe_code)]

use recount_kernel_contracts::count::{CountRefusal, ReleasePhaseRequest};
use recount_kernel_contracts::slot::{CountPhase, SlotRecord, SlotStatus, MAX_PHASE_COUNT};
use recount_kernel_contracts::ReasonCodeId;

use crate::EngineError;

pub mod reason_codes {
    use recount_kernel_contracts::ReasonCodeId;

    pub const GATE_PHASE_RELEASED: ReasonCodeId = ReasonCodeId(0x6A7E_0001);
    pub const GATE_ALREADY_RELEASED: ReasonCodeId = ReasonCodeId(0x6A7E_0002);
}

/// Whether a freshly created slot may take its secondary count without a release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GatePolicy {
    #[default]
    OpenSecondary,
    ReleaseBeforeSecondary,
}

impl GatePolicy {
    pub fn initial_may_advance(self) -> bool {
        matches!(self, GatePolicy::OpenSecondary)
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_ascii_lowercase().as_str() {
            "open_secondary" => Some(GatePolicy::OpenSecondary),
            "release_before_secondary" => Some(GatePolicy::ReleaseBeforeSecondary),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GatePolicy::OpenSecondary => "open_secondary",
            GatePolicy::ReleaseBeforeSecondary => "release_before_secondary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDecision {
    pub record: SlotRecord,
    /// False when the target phase was already open; nothing needs persisting.
    pub changed: bool,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Default, Clone)]
pub struct PhaseGate;

impl PhaseGate {
    /// Admission check for a phase > 1 submission that is otherwise in sequence.
    pub fn check_submission(
        &self,
        record: &SlotRecord,
        phase: CountPhase,
    ) -> Result<(), CountRefusal> {
        if phase == CountPhase::Primary {
            return Ok(());
        }
        if !record.may_advance {
            return Err(CountRefusal::NotAuthorized {
                reason: "next phase has not been released",
            });
        }
        Ok(())
    }

    pub fn evaluate_release(
        &self,
        record: &SlotRecord,
        req: &ReleasePhaseRequest,
    ) -> Result<ReleaseDecision, EngineError> {
        if !req.actor.role.is_privileged() {
            return Err(CountRefusal::NotAuthorized {
                reason: "release requires a privileged actor",
            }
            .into());
        }
        if record.finalized {
            return Err(CountRefusal::InvalidTransition {
                reason: "record is finalized",
            }
            .into());
        }
        if record.status == SlotStatus::Concluded {
            return Err(CountRefusal::InvalidTransition {
                reason: "slot already concluded",
            }
            .into());
        }
        if record.phase_count >= MAX_PHASE_COUNT
            || req.target_phase.number() != record.phase_count + 1
        {
            return Err(CountRefusal::InvalidTransition {
                reason: "target_phase must be phase_count + 1",
            }
            .into());
        }

        if record.may_advance {
            return Ok(ReleaseDecision {
                record: record.clone(),
                changed: false,
                reason_code: reason_codes::GATE_ALREADY_RELEASED,
            });
        }
        let mut next = record.clone();
        next.may_advance = true;
        Ok(ReleaseDecision {
            record: next,
            changed: true,
            reason_code: reason_codes::GATE_PHASE_RELEASED,
        })
    }
}

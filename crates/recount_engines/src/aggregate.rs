#![forbid(unsafe_code)]

use recount_kernel_contracts::count::{CountRefusal, SubmitCountRequest};
use recount_kernel_contracts::slot::{Quantity, SlotLedgerAction, SlotRecord, SlotStatus};
use recount_kernel_contracts::{ContractViolation, ReasonCodeId};
use rust_decimal::Decimal;

use crate::phase_gate::GatePolicy;
use crate::EngineError;

pub mod reason_codes {
    use recount_kernel_contracts::ReasonCodeId;

    pub const AGG_SLOT_CREATED: ReasonCodeId = ReasonCodeId(0xA660_0001);
    pub const AGG_PRIMARY_MERGED: ReasonCodeId = ReasonCodeId(0xA660_0002);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDecision {
    pub record: SlotRecord,
    pub action: SlotLedgerAction,
    pub reason_code: ReasonCodeId,
}

/// Folds primary-phase passes over the same slot into one running sum.
#[derive(Debug, Default, Clone)]
pub struct PrimaryAggregator;

impl PrimaryAggregator {
    pub fn evaluate(
        &self,
        existing: Option<&SlotRecord>,
        req: &SubmitCountRequest,
        policy: GatePolicy,
    ) -> Result<AggregateDecision, EngineError> {
        if req.quantity <= Decimal::ZERO {
            return Err(CountRefusal::InvalidQuantity.into());
        }
        let quantity = Quantity::new(req.quantity)?;

        let Some(current) = existing else {
            let record = SlotRecord::new_primary_v1(
                req.key.clone(),
                quantity,
                req.contributor.actor_id.clone(),
                req.now,
                policy.initial_may_advance(),
                req.metadata.clone(),
            )?;
            return Ok(AggregateDecision {
                record,
                action: SlotLedgerAction::Created,
                reason_code: reason_codes::AGG_SLOT_CREATED,
            });
        };

        if current.finalized {
            return Err(CountRefusal::InvalidTransition {
                reason: "record is finalized",
            }
            .into());
        }
        if current.status != SlotStatus::Primary || current.phase_count != 1 {
            return Err(CountRefusal::AlreadyAdvanced {
                status: current.status,
            }
            .into());
        }

        let sum = current
            .quantity_primary
            .value()
            .checked_add(quantity.value())
            .ok_or(ContractViolation::InvalidValue {
                field: "slot_record.quantity_primary",
                reason: "sum exceeds decimal range",
            })?;
        let mut next = current.clone();
        next.quantity_primary = Quantity::new(sum)?;
        next.primary_contributor = req.contributor.actor_id.clone();
        // Out-of-order arrivals must not move the stamp backwards.
        next.primary_counted_at = current.primary_counted_at.max(req.now);
        next.metadata = current.metadata.fill_missing_from(&req.metadata);
        Ok(AggregateDecision {
            record: next,
            action: SlotLedgerAction::PrimaryMerged,
            reason_code: reason_codes::AGG_PRIMARY_MERGED,
        })
    }
}

#![forbid(unsafe_code)]

use recount_kernel_contracts::count::{CountRefusal, SubmitCountRequest};
use recount_kernel_contracts::slot::{
    CountPhase, Quantity, SlotLedgerAction, SlotRecord, SlotStatus,
};
use recount_kernel_contracts::{ContractViolation, ReasonCodeId};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::aggregate::PrimaryAggregator;
use crate::phase_gate::{GatePolicy, PhaseGate};
use crate::EngineError;

pub mod reason_codes {
    use recount_kernel_contracts::ReasonCodeId;

    pub const RECON_EXACT_MATCH: ReasonCodeId = ReasonCodeId(0x5EC0_0001);
    pub const RECON_WITHIN_TOLERANCE: ReasonCodeId = ReasonCodeId(0x5EC0_0002);
    pub const RECON_DIVERGENT: ReasonCodeId = ReasonCodeId(0x5EC0_0003);
    pub const RECON_TIE_BROKEN: ReasonCodeId = ReasonCodeId(0x5EC0_0004);
    pub const RECON_MEDIAN: ReasonCodeId = ReasonCodeId(0x5EC0_0005);
}

/// Relative divergence at or below which two counts agree (10%).
pub fn divergence_tolerance() -> Decimal {
    Decimal::new(10, 2)
}

/// `|a - b| / max(a, b, 1)`.
pub fn relative_divergence(a: Decimal, b: Decimal) -> Decimal {
    let denominator = a.max(b).max(Decimal::ONE);
    (a - b).abs() / denominator
}

/// Round-half-up to a whole unit. Quantities are never negative, so away-from-zero is half-up.
pub fn round_half_up(v: Decimal) -> Decimal {
    v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileOutcome {
    /// Primary-phase create or merge; nothing compared yet.
    Aggregated,
    ExactMatch,
    WithinTolerance,
    Divergent,
    TieBroken,
    Median,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionDecision {
    pub phase: CountPhase,
    pub record: SlotRecord,
    pub action: SlotLedgerAction,
    pub outcome: ReconcileOutcome,
    pub reason_code: ReasonCodeId,
}

/// Picks the phase a submission targets. An explicit phase wins; otherwise the slot's next
/// phase, clamped to tertiary so a fully counted slot fails the sequence check.
pub fn infer_phase(existing: Option<&SlotRecord>, requested: Option<CountPhase>) -> CountPhase {
    if let Some(phase) = requested {
        return phase;
    }
    match existing {
        None => CountPhase::Primary,
        Some(r) => r.next_phase().unwrap_or(CountPhase::Tertiary),
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileRuntime {
    aggregator: PrimaryAggregator,
    gate: PhaseGate,
}

impl ReconcileRuntime {
    pub fn evaluate_submission(
        &self,
        existing: Option<&SlotRecord>,
        req: &SubmitCountRequest,
        policy: GatePolicy,
    ) -> Result<SubmissionDecision, EngineError> {
        if req.quantity <= Decimal::ZERO {
            return Err(CountRefusal::InvalidQuantity.into());
        }
        let phase = infer_phase(existing, req.phase);

        if phase == CountPhase::Primary {
            let d = self.aggregator.evaluate(existing, req, policy)?;
            return Ok(SubmissionDecision {
                phase,
                record: d.record,
                action: d.action,
                outcome: ReconcileOutcome::Aggregated,
                reason_code: d.reason_code,
            });
        }

        let Some(current) = existing else {
            return Err(CountRefusal::InvalidTransition {
                reason: "no primary count recorded for slot",
            }
            .into());
        };
        check_sequence(current, phase)?;
        self.gate.check_submission(current, phase)?;

        let quantity = Quantity::new(req.quantity)?;
        match phase {
            CountPhase::Secondary => resolve_secondary(current, quantity, req),
            CountPhase::Tertiary => resolve_tertiary(current, quantity, req),
            CountPhase::Primary => Err(ContractViolation::InvalidValue {
                field: "reconcile.phase",
                reason: "primary handled by aggregator",
            }
            .into()),
        }
    }
}

fn check_sequence(current: &SlotRecord, phase: CountPhase) -> Result<(), CountRefusal> {
    if current.finalized {
        return Err(CountRefusal::InvalidTransition {
            reason: "record is finalized",
        });
    }
    if current.status == SlotStatus::Concluded {
        return Err(CountRefusal::InvalidTransition {
            reason: "slot already concluded",
        });
    }
    let in_sequence = match phase {
        CountPhase::Primary => current.phase_count == 1,
        CountPhase::Secondary => current.phase_count == 1 && current.status == SlotStatus::Primary,
        CountPhase::Tertiary => {
            current.phase_count == 2 && current.status == SlotStatus::Divergent
        }
    };
    if !in_sequence {
        return Err(CountRefusal::InvalidTransition {
            reason: "count phase out of sequence",
        });
    }
    Ok(())
}

fn resolve_secondary(
    current: &SlotRecord,
    secondary: Quantity,
    req: &SubmitCountRequest,
) -> Result<SubmissionDecision, EngineError> {
    let primary = current.quantity_primary.value();
    let s = secondary.value();

    let mut next = current.clone();
    next.quantity_secondary = Some(secondary);
    next.secondary_contributor = Some(req.contributor.actor_id.clone());
    next.secondary_counted_at = Some(req.now);
    next.phase_count = CountPhase::Secondary.number();
    next.may_advance = false;

    let (outcome, reason_code) = if primary == s {
        next.status = SlotStatus::Concluded;
        next.quantity_final = Some(current.quantity_primary);
        (ReconcileOutcome::ExactMatch, reason_codes::RECON_EXACT_MATCH)
    } else if relative_divergence(primary, s) <= divergence_tolerance() {
        let sum = primary
            .checked_add(s)
            .ok_or(ContractViolation::InvalidValue {
                field: "slot_record.quantity_final",
                reason: "average exceeds decimal range",
            })?;
        next.status = SlotStatus::Concluded;
        next.quantity_final = Some(Quantity::new(round_half_up(sum / Decimal::TWO))?);
        (
            ReconcileOutcome::WithinTolerance,
            reason_codes::RECON_WITHIN_TOLERANCE,
        )
    } else {
        next.status = SlotStatus::Divergent;
        next.quantity_final = None;
        (ReconcileOutcome::Divergent, reason_codes::RECON_DIVERGENT)
    };

    Ok(SubmissionDecision {
        phase: CountPhase::Secondary,
        record: next,
        action: SlotLedgerAction::SecondaryAccepted,
        outcome,
        reason_code,
    })
}

fn resolve_tertiary(
    current: &SlotRecord,
    tertiary: Quantity,
    req: &SubmitCountRequest,
) -> Result<SubmissionDecision, EngineError> {
    let secondary = current.quantity_secondary.ok_or(CountRefusal::InvalidTransition {
        reason: "tertiary count requires a secondary count",
    })?;
    let observations = [current.quantity_primary, secondary, tertiary];
    let (final_quantity, outcome, reason_code) = match truncated_match(&observations) {
        Some(q) => (q, ReconcileOutcome::TieBroken, reason_codes::RECON_TIE_BROKEN),
        None => (
            median_of_three(&observations),
            ReconcileOutcome::Median,
            reason_codes::RECON_MEDIAN,
        ),
    };

    let mut next = current.clone();
    next.quantity_tertiary = Some(tertiary);
    next.tertiary_contributor = Some(req.contributor.actor_id.clone());
    next.tertiary_counted_at = Some(req.now);
    next.phase_count = CountPhase::Tertiary.number();
    next.may_advance = false;
    next.status = SlotStatus::Concluded;
    next.quantity_final = Some(final_quantity);

    Ok(SubmissionDecision {
        phase: CountPhase::Tertiary,
        record: next,
        action: SlotLedgerAction::TertiaryAccepted,
        outcome,
        reason_code,
    })
}

/// First observation (in phase order) whose integer part is shared with a later one.
/// Compares integer parts: 100.9 and 100.1 match, 99.9 and 100.1 do not.
fn truncated_match(observations: &[Quantity; 3]) -> Option<Quantity> {
    for i in 0..observations.len() {
        for j in (i + 1)..observations.len() {
            if observations[i].value().trunc() == observations[j].value().trunc() {
                return Some(observations[i]);
            }
        }
    }
    None
}

fn median_of_three(observations: &[Quantity; 3]) -> Quantity {
    let mut sorted = *observations;
    sorted.sort();
    sorted[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use recount_kernel_contracts::slot::{
        ActorId, ActorRef, InventoryId, ItemCode, LocationCode, SlotKey, SlotMetadata,
    };
    use recount_kernel_contracts::{MonotonicTimeNs, Validate};
    use std::str::FromStr;

    fn d(v: &str) -> Decimal {
        Decimal::from_str(v).unwrap()
    }

    fn key() -> SlotKey {
        SlotKey::v1(
            InventoryId::new("inv_1").unwrap(),
            LocationCode::new("A-01").unwrap(),
            ItemCode::new("SKU-1").unwrap(),
            None,
        )
    }

    fn submit(phase: Option<CountPhase>, q: Decimal, t: u64) -> SubmitCountRequest {
        SubmitCountRequest::v1(
            key(),
            phase,
            q,
            ActorRef::operator(ActorId::new(format!("op_{t}")).unwrap()),
            SlotMetadata::default(),
            MonotonicTimeNs(t),
        )
        .unwrap()
    }

    fn run(
        rt: &ReconcileRuntime,
        current: Option<&SlotRecord>,
        phase: Option<CountPhase>,
        q: Decimal,
        t: u64,
    ) -> Result<SubmissionDecision, EngineError> {
        rt.evaluate_submission(current, &submit(phase, q, t), GatePolicy::OpenSecondary)
    }

    fn with_secondary(p: &str, s: &str) -> SubmissionDecision {
        let rt = ReconcileRuntime::default();
        let primary = run(&rt, None, None, d(p), 1).unwrap().record;
        run(&rt, Some(&primary), None, d(s), 2).unwrap()
    }

    fn released(mut r: SlotRecord) -> SlotRecord {
        r.may_advance = true;
        r
    }

    #[test]
    fn at_recon_01_exact_match_concludes_with_primary() {
        let out = with_secondary("100", "100");
        assert_eq!(out.outcome, ReconcileOutcome::ExactMatch);
        assert_eq!(out.record.status, SlotStatus::Concluded);
        assert_eq!(out.record.quantity_final.unwrap().value(), d("100"));
        assert_eq!(out.record.phase_count, 2);
        assert!(out.record.validate().is_ok());
    }

    #[test]
    fn at_recon_02_within_tolerance_rounds_half_up() {
        let out = with_secondary("100", "105");
        assert_eq!(out.outcome, ReconcileOutcome::WithinTolerance);
        assert_eq!(out.record.status, SlotStatus::Concluded);
        assert_eq!(out.record.quantity_final.unwrap().value(), d("103"));
    }

    #[test]
    fn at_recon_03_rounding_mode_is_half_up_not_half_even() {
        // 102.5 -> 103 and 101.5 -> 102; half-even would give 102 for both.
        assert_eq!(round_half_up(d("102.5")), d("103"));
        assert_eq!(round_half_up(d("101.5")), d("102"));
        assert_eq!(round_half_up(d("101.49")), d("101"));
        assert_eq!(with_secondary("100", "103").record.quantity_final.unwrap().value(), d("102"));
    }

    #[test]
    fn at_recon_04_divergence_over_tolerance_escalates() {
        let out = with_secondary("100", "130");
        assert_eq!(out.outcome, ReconcileOutcome::Divergent);
        assert_eq!(out.record.status, SlotStatus::Divergent);
        assert_eq!(out.record.quantity_final, None);
        assert!(!out.record.may_advance);
        assert!(out.record.validate().is_ok());
    }

    #[test]
    fn at_recon_05_tolerance_boundary_is_inclusive() {
        // 10 / max(100, 110, 1) = 0.0909..; 10 / max(90, 100, 1) = 0.10 exactly.
        assert_eq!(with_secondary("90", "100").outcome, ReconcileOutcome::WithinTolerance);
        assert_eq!(with_secondary("100", "112").outcome, ReconcileOutcome::Divergent);
    }

    #[test]
    fn at_recon_06_denominator_floor_of_one_for_small_counts() {
        assert_eq!(relative_divergence(d("0.5"), d("0.45")), d("0.05"));
        assert_eq!(with_secondary("0.5", "0.45").outcome, ReconcileOutcome::WithinTolerance);
    }

    #[test]
    fn at_recon_07_tertiary_truncated_match_wins() {
        let rt = ReconcileRuntime::default();
        let divergent = with_secondary("100", "130").record;
        let out = run(&rt, Some(&released(divergent)), None, d("100"), 3).unwrap();
        assert_eq!(out.phase, CountPhase::Tertiary);
        assert_eq!(out.outcome, ReconcileOutcome::TieBroken);
        assert_eq!(out.record.status, SlotStatus::Concluded);
        assert_eq!(out.record.quantity_final.unwrap().value(), d("100"));
        assert_eq!(out.record.phase_count, 3);
        assert!(out.record.validate().is_ok());
    }

    #[test]
    fn at_recon_08_tertiary_all_distinct_takes_median() {
        let rt = ReconcileRuntime::default();
        let divergent = with_secondary("100", "130").record;
        let out = run(&rt, Some(&released(divergent)), None, d("115"), 3).unwrap();
        assert_eq!(out.outcome, ReconcileOutcome::Median);
        assert_eq!(out.record.quantity_final.unwrap().value(), d("115"));
    }

    #[test]
    fn at_recon_09_truncation_ties_fractional_values() {
        let rt = ReconcileRuntime::default();
        let divergent = with_secondary("100.9", "130").record;
        let tie = run(&rt, Some(&released(divergent)), None, d("100.1"), 3).unwrap();
        assert_eq!(tie.outcome, ReconcileOutcome::TieBroken);
        assert_eq!(tie.record.quantity_final.unwrap().value(), d("100.9"));

        let divergent = with_secondary("99.9", "130").record;
        let no_tie = run(&rt, Some(&released(divergent)), None, d("100.1"), 3).unwrap();
        assert_eq!(no_tie.outcome, ReconcileOutcome::Median);
        assert_eq!(no_tie.record.quantity_final.unwrap().value(), d("100.1"));
    }

    #[test]
    fn at_recon_10_tertiary_without_release_is_not_authorized() {
        let rt = ReconcileRuntime::default();
        let divergent = with_secondary("100", "130").record;
        assert_eq!(
            run(&rt, Some(&divergent), None, d("100"), 3),
            Err(EngineError::Refused(CountRefusal::NotAuthorized {
                reason: "next phase has not been released",
            }))
        );
    }

    #[test]
    fn at_recon_11_out_of_sequence_phases_are_rejected() {
        let rt = ReconcileRuntime::default();
        let primary = run(&rt, None, None, d("10"), 1).unwrap().record;
        assert_eq!(
            run(&rt, Some(&primary), Some(CountPhase::Tertiary), d("10"), 2),
            Err(EngineError::Refused(CountRefusal::InvalidTransition {
                reason: "count phase out of sequence",
            }))
        );
        assert_eq!(
            run(&rt, None, Some(CountPhase::Secondary), d("10"), 2),
            Err(EngineError::Refused(CountRefusal::InvalidTransition {
                reason: "no primary count recorded for slot",
            }))
        );
        let concluded = with_secondary("10", "10").record;
        assert_eq!(
            run(&rt, Some(&concluded), None, d("10"), 3),
            Err(EngineError::Refused(CountRefusal::InvalidTransition {
                reason: "slot already concluded",
            }))
        );
    }

    #[test]
    fn at_recon_12_explicit_primary_after_advance_is_already_advanced() {
        let rt = ReconcileRuntime::default();
        let divergent = with_secondary("100", "130").record;
        assert_eq!(
            run(&rt, Some(&divergent), Some(CountPhase::Primary), d("5"), 3),
            Err(EngineError::Refused(CountRefusal::AlreadyAdvanced {
                status: SlotStatus::Divergent,
            }))
        );
    }

    #[test]
    fn at_recon_13_finalized_record_rejects_every_phase() {
        let rt = ReconcileRuntime::default();
        let mut sealed = with_secondary("100", "130").record;
        sealed.finalized = true;
        sealed.finalized_at = Some(MonotonicTimeNs(9));
        sealed.finalized_by = Some(ActorId::new("sup").unwrap());
        sealed.may_advance = true;
        for phase in [None, Some(CountPhase::Primary), Some(CountPhase::Tertiary)] {
            assert_eq!(
                run(&rt, Some(&sealed), phase, d("100"), 10),
                Err(EngineError::Refused(CountRefusal::InvalidTransition {
                    reason: "record is finalized",
                }))
            );
        }
    }

    #[test]
    fn at_recon_14_zero_quantity_rejected_before_phase_checks() {
        let rt = ReconcileRuntime::default();
        let divergent = with_secondary("100", "130").record;
        assert_eq!(
            run(&rt, Some(&divergent), None, Decimal::ZERO, 3),
            Err(EngineError::Refused(CountRefusal::InvalidQuantity))
        );
    }

    proptest! {
        #[test]
        fn at_recon_prop_01_final_lies_within_observed_range(
            p in 1_i64..100_000, s in 1_i64..100_000, t in 1_i64..100_000, scale in 0_u32..3,
        ) {
            let rt = ReconcileRuntime::default();
            let (p, s, t) = (Decimal::new(p, scale), Decimal::new(s, scale), Decimal::new(t, scale));
            let primary = run(&rt, None, None, p, 1).unwrap().record;
            let second = run(&rt, Some(&primary), None, s, 2).unwrap();
            let resolved = if second.record.status == SlotStatus::Divergent {
                run(&rt, Some(&released(second.record)), None, t, 3).unwrap().record
            } else {
                second.record
            };
            prop_assert_eq!(resolved.status, SlotStatus::Concluded);
            prop_assert!(resolved.validate().is_ok());
            let final_value = resolved.quantity_final.unwrap().value();
            let observed: Vec<Decimal> = [
                Some(resolved.quantity_primary),
                resolved.quantity_secondary,
                resolved.quantity_tertiary,
            ]
            .into_iter()
            .flatten()
            .map(Quantity::value)
            .collect();
            let lo = observed.iter().copied().min().unwrap();
            let hi = observed.iter().copied().max().unwrap();
            // Averages round to a whole unit, so allow half a unit of slack.
            prop_assert!(final_value >= round_half_up(lo) - Decimal::ONE);
            prop_assert!(final_value <= hi + Decimal::ONE);
        }
    }
}

#![forbid(unsafe_code)]

use std::time::Duration;

use recount_engines::phase_gate::{GatePolicy, PhaseGate};
use recount_engines::reconcile::ReconcileRuntime;
use recount_engines::seal::SealRuntime;
use recount_kernel_contracts::count::{
    CountRequest, CountResponse, FinalizeRequest, Page, ReleasePhaseRequest, SlotListQuery,
    SubmitCountRequest,
};
use recount_kernel_contracts::slot::{
    CountPhase, SlotKey, SlotLedgerAction, SlotLedgerEvent, SlotRecord, SlotRecordId,
};
use recount_kernel_contracts::{ContractViolation, Validate};
use recount_storage::repo::SlotRecordRepo;
use recount_storage::slot_store::StorageError;
use tracing::{debug, info, warn};

use crate::error::CountError;
use crate::notify::{NoopNotifier, SlotNotice, SlotNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub gate_policy: GatePolicy,
    /// Re-read and re-merge rounds a primary submission gets after losing a write race.
    pub max_merge_attempts: u32,
    /// Extra attempts after a `StorageError::Unavailable`.
    pub storage_retry_max: u32,
    /// Linear backoff step between storage retries.
    pub storage_retry_backoff_ms: u64,
}

impl ReconcileConfig {
    pub fn mvp_v1() -> Self {
        Self {
            gate_policy: GatePolicy::OpenSecondary,
            max_merge_attempts: 16,
            storage_retry_max: 3,
            storage_retry_backoff_ms: 25,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl Validate for ReconcileConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.max_merge_attempts == 0 || self.max_merge_attempts > 1_000 {
            return Err(ContractViolation::InvalidRange {
                field: "reconcile_config.max_merge_attempts",
                min: 1.0,
                max: 1_000.0,
                got: self.max_merge_attempts as f64,
            });
        }
        if self.storage_retry_max > 20 {
            return Err(ContractViolation::InvalidRange {
                field: "reconcile_config.storage_retry_max",
                min: 0.0,
                max: 20.0,
                got: self.storage_retry_max as f64,
            });
        }
        if self.storage_retry_backoff_ms > 10_000 {
            return Err(ContractViolation::InvalidRange {
                field: "reconcile_config.storage_retry_backoff_ms",
                min: 0.0,
                max: 10_000.0,
                got: self.storage_retry_backoff_ms as f64,
            });
        }
        Ok(())
    }
}

/// Orchestrates count submissions, gate releases and seals over a slot repository.
///
/// Each call is read, decide, conditional write. Engines decide; the repository's version
/// check serializes writers on the same slot.
#[derive(Debug)]
pub struct CountRuntime<R, N = NoopNotifier> {
    repo: R,
    notifier: N,
    config: ReconcileConfig,
    reconcile: ReconcileRuntime,
    gate: PhaseGate,
    seal: SealRuntime,
}

impl<R: SlotRecordRepo> CountRuntime<R, NoopNotifier> {
    pub fn new(repo: R, config: ReconcileConfig) -> Result<Self, ContractViolation> {
        Self::with_notifier(repo, NoopNotifier, config)
    }
}

impl<R: SlotRecordRepo, N: SlotNotifier> CountRuntime<R, N> {
    pub fn with_notifier(
        repo: R,
        notifier: N,
        config: ReconcileConfig,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self {
            repo,
            notifier,
            config,
            reconcile: ReconcileRuntime::default(),
            gate: PhaseGate,
            seal: SealRuntime,
        })
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> ReconcileConfig {
        self.config
    }

    pub fn run(&self, req: &CountRequest) -> Result<CountResponse, CountError> {
        match req {
            CountRequest::SubmitCount(r) => {
                let record = self.submit_count(r)?;
                Ok(CountResponse::Counted { record })
            }
            CountRequest::ReleasePhase(r) => {
                self.release_phase(r)?;
                Ok(CountResponse::PhaseReleased {
                    record_id: r.record_id,
                    target_phase: r.target_phase,
                })
            }
            CountRequest::Finalize(r) => {
                self.finalize(r)?;
                Ok(CountResponse::Finalized {
                    record_id: r.record_id,
                })
            }
        }
    }

    pub fn submit_count(&self, req: &SubmitCountRequest) -> Result<SlotRecord, CountError> {
        req.validate()?;
        let mut lost_races: u32 = 0;
        loop {
            let existing = self.with_storage_retry("slot_row_by_key", || {
                self.repo.slot_row_by_key(&req.key)
            })?;
            let decision = self
                .reconcile
                .evaluate_submission(existing.as_ref(), req, self.config.gate_policy)
                .map_err(|e| {
                    let e = CountError::from(e);
                    debug!(
                        kind = e.kind(),
                        inventory_id = req.key.inventory_id.as_str(),
                        location_code = req.key.location_code.as_str(),
                        item_code = req.key.item_code.as_str(),
                        "count submission rejected: {e}"
                    );
                    e
                })?;

            let write = match &existing {
                None => self.with_storage_retry("insert_slot_row", || {
                    self.repo.insert_slot_row(
                        decision.record.clone(),
                        &req.contributor.actor_id,
                        req.now,
                    )
                }),
                Some(current) => self.with_storage_retry("cas_slot_row", || {
                    self.repo.cas_slot_row(
                        current.version,
                        decision.record.clone(),
                        decision.action,
                        &req.contributor.actor_id,
                        req.now,
                    )
                }),
            };

            match write {
                Ok(stored) => {
                    info!(
                        record_id = stored.record_id.0,
                        version = stored.version,
                        phase = decision.phase.as_str(),
                        status = stored.status.as_str(),
                        outcome = ?decision.outcome,
                        reason_code = decision.reason_code.0,
                        "count accepted"
                    );
                    self.notify(&stored, decision.action);
                    return Ok(stored);
                }
                Err(
                    e @ (StorageError::DuplicateKey { .. } | StorageError::VersionConflict { .. }),
                ) if decision.phase == CountPhase::Primary => {
                    lost_races += 1;
                    if lost_races >= self.config.max_merge_attempts {
                        warn!(
                            attempts = lost_races,
                            "primary merge gave up after repeated write races"
                        );
                        return Err(CountError::Conflict {
                            detail: format!("primary merge lost {lost_races} write races: {e}"),
                        });
                    }
                    warn!(attempt = lost_races, "primary merge lost write race; re-merging: {e}");
                }
                Err(e) => {
                    let e = CountError::from(e);
                    if e.kind() == "conflict" {
                        warn!(phase = decision.phase.as_str(), "count lost write race: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn release_phase(&self, req: &ReleasePhaseRequest) -> Result<(), CountError> {
        req.validate()?;
        let current = self.load_by_id(req.record_id)?;
        let decision = self.gate.evaluate_release(&current, req).map_err(|e| {
            let e = CountError::from(e);
            debug!(record_id = req.record_id.0, kind = e.kind(), "release rejected: {e}");
            e
        })?;
        if !decision.changed {
            debug!(
                record_id = req.record_id.0,
                target_phase = req.target_phase.as_str(),
                "phase already released"
            );
            return Ok(());
        }
        let stored = self.with_storage_retry("cas_slot_row", || {
            self.repo.cas_slot_row(
                current.version,
                decision.record.clone(),
                SlotLedgerAction::PhaseReleased,
                &req.actor.actor_id,
                req.now,
            )
        })?;
        info!(
            record_id = stored.record_id.0,
            target_phase = req.target_phase.as_str(),
            actor_id = req.actor.actor_id.as_str(),
            "phase released"
        );
        self.notify(&stored, SlotLedgerAction::PhaseReleased);
        Ok(())
    }

    pub fn finalize(&self, req: &FinalizeRequest) -> Result<(), CountError> {
        req.validate()?;
        let current = self.load_by_id(req.record_id)?;
        let decision = self.seal.evaluate(&current, req).map_err(|e| {
            let e = CountError::from(e);
            debug!(record_id = req.record_id.0, kind = e.kind(), "finalize rejected: {e}");
            e
        })?;
        if !decision.changed {
            return Ok(());
        }
        let stored = match self.with_storage_retry("cas_slot_row", || {
            self.repo.cas_slot_row(
                current.version,
                decision.record.clone(),
                SlotLedgerAction::Finalized,
                &req.actor.actor_id,
                req.now,
            )
        }) {
            Ok(stored) => stored,
            Err(e @ StorageError::VersionConflict { .. }) => {
                // Sealing is idempotent: losing the race to another seal is still a seal.
                let latest = self.load_by_id(req.record_id)?;
                if latest.finalized {
                    debug!(record_id = req.record_id.0, "slot sealed by a concurrent finalize");
                    return Ok(());
                }
                warn!(record_id = req.record_id.0, "finalize lost write race: {e}");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            record_id = stored.record_id.0,
            status = stored.status.as_str(),
            actor_id = req.actor.actor_id.as_str(),
            "slot finalized"
        );
        self.notify(&stored, SlotLedgerAction::Finalized);
        Ok(())
    }

    pub fn get_record(&self, key: &SlotKey) -> Result<Option<SlotRecord>, CountError> {
        key.validate()?;
        Ok(self.with_storage_retry("slot_row_by_key", || self.repo.slot_row_by_key(key))?)
    }

    pub fn get_record_by_id(
        &self,
        record_id: SlotRecordId,
    ) -> Result<Option<SlotRecord>, CountError> {
        record_id.validate()?;
        Ok(self.with_storage_retry("slot_row_by_id", || self.repo.slot_row_by_id(record_id))?)
    }

    pub fn list_records(&self, query: &SlotListQuery) -> Result<Page<SlotRecord>, CountError> {
        query.validate()?;
        Ok(self.with_storage_retry("list_slot_rows", || self.repo.list_slot_rows(query))?)
    }

    pub fn slot_events(&self, record_id: SlotRecordId) -> Result<Vec<SlotLedgerEvent>, CountError> {
        record_id.validate()?;
        Ok(self.with_storage_retry("slot_event_rows", || self.repo.slot_event_rows(record_id))?)
    }

    fn load_by_id(&self, record_id: SlotRecordId) -> Result<SlotRecord, CountError> {
        self.with_storage_retry("slot_row_by_id", || self.repo.slot_row_by_id(record_id))?
            .ok_or(CountError::RecordNotFound {
                record_id: record_id.0,
            })
    }

    /// Runs `op`, retrying only `StorageError::Unavailable` with linear backoff.
    /// Every other storage error is handed back untouched for the caller to classify.
    fn with_storage_retry<T>(
        &self,
        op_name: &'static str,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Err(StorageError::Unavailable(msg)) if attempt < self.config.storage_retry_max => {
                    attempt += 1;
                    warn!(op = op_name, attempt, "storage unavailable; retrying: {msg}");
                    let backoff = self
                        .config
                        .storage_retry_backoff_ms
                        .saturating_mul(u64::from(attempt));
                    if backoff > 0 {
                        std::thread::sleep(Duration::from_millis(backoff));
                    }
                }
                other => return other,
            }
        }
    }

    fn notify(&self, record: &SlotRecord, action: SlotLedgerAction) {
        let notice = SlotNotice {
            record_id: record.record_id,
            action,
            status: record.status,
            may_advance: record.may_advance,
            finalized: record.finalized,
        };
        if let Err(err) = self.notifier.slot_changed(&notice) {
            warn!(record_id = record.record_id.0, "slot notification dropped: {err}");
        }
    }
}

#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::slot::{
    ActorRef, CountPhase, InventoryId, ItemCode, LocationCode, SlotKey, SlotMetadata, SlotRecord,
    SlotRecordId, SlotStatus,
};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const COUNT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const DEFAULT_PAGE_LIMIT: u16 = 100;
pub const MAX_PAGE_LIMIT: u16 = 500;

fn validate_now(field: &'static str, now: MonotonicTimeNs) -> Result<(), ContractViolation> {
    if now.0 == 0 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be > 0",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCountRequest {
    pub key: SlotKey,
    /// `None` lets the engine infer the phase from the stored record.
    pub phase: Option<CountPhase>,
    /// Raw observation; positivity is a business rule, checked by the engine.
    pub quantity: Decimal,
    pub contributor: ActorRef,
    pub metadata: SlotMetadata,
    pub now: MonotonicTimeNs,
}

impl SubmitCountRequest {
    pub fn v1(
        key: SlotKey,
        phase: Option<CountPhase>,
        quantity: Decimal,
        contributor: ActorRef,
        metadata: SlotMetadata,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            key,
            phase,
            quantity,
            contributor,
            metadata,
            now,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for SubmitCountRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.key.validate()?;
        self.contributor.actor_id.validate()?;
        self.metadata.validate()?;
        validate_now("submit_count_request.now", self.now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePhaseRequest {
    pub record_id: SlotRecordId,
    pub target_phase: CountPhase,
    pub actor: ActorRef,
    pub now: MonotonicTimeNs,
}

impl ReleasePhaseRequest {
    pub fn v1(
        record_id: SlotRecordId,
        target_phase: CountPhase,
        actor: ActorRef,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            record_id,
            target_phase,
            actor,
            now,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ReleasePhaseRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.record_id.validate()?;
        self.actor.actor_id.validate()?;
        validate_now("release_phase_request.now", self.now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub record_id: SlotRecordId,
    pub actor: ActorRef,
    pub now: MonotonicTimeNs,
}

impl FinalizeRequest {
    pub fn v1(
        record_id: SlotRecordId,
        actor: ActorRef,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            record_id,
            actor,
            now,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for FinalizeRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.record_id.validate()?;
        self.actor.actor_id.validate()?;
        validate_now("finalize_request.now", self.now)
    }
}

/// Closed set of mutating operations accepted by the reconciliation runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CountRequest {
    SubmitCount(SubmitCountRequest),
    ReleasePhase(ReleasePhaseRequest),
    Finalize(FinalizeRequest),
}

impl Validate for CountRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            CountRequest::SubmitCount(r) => r.validate(),
            CountRequest::ReleasePhase(r) => r.validate(),
            CountRequest::Finalize(r) => r.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CountResponse {
    Counted { record: SlotRecord },
    PhaseReleased {
        record_id: SlotRecordId,
        target_phase: CountPhase,
    },
    Finalized { record_id: SlotRecordId },
}

/// Business-rule rejection. Terminal for the call; retrying with the same input cannot help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountRefusal {
    InvalidQuantity,
    NotAuthorized { reason: &'static str },
    InvalidTransition { reason: &'static str },
    AlreadyAdvanced { status: SlotStatus },
}

impl std::fmt::Display for CountRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountRefusal::InvalidQuantity => write!(f, "quantity must be > 0"),
            CountRefusal::NotAuthorized { reason } => write!(f, "not authorized: {reason}"),
            CountRefusal::InvalidTransition { reason } => write!(f, "invalid transition: {reason}"),
            CountRefusal::AlreadyAdvanced { status } => {
                write!(f, "slot already advanced past primary (status={})", status.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotListFilter {
    pub status: Option<SlotStatus>,
    pub location_code: Option<LocationCode>,
    pub item_code: Option<ItemCode>,
    pub finalized: Option<bool>,
    /// Only slots waiting on a tertiary count.
    #[serde(default)]
    pub divergent_only: bool,
}

impl SlotListFilter {
    pub fn matches(&self, r: &SlotRecord) -> bool {
        if let Some(status) = self.status {
            if r.status != status {
                return false;
            }
        }
        if let Some(loc) = &self.location_code {
            if &r.key.location_code != loc {
                return false;
            }
        }
        if let Some(item) = &self.item_code {
            if &r.key.item_code != item {
                return false;
            }
        }
        if let Some(finalized) = self.finalized {
            if r.finalized != finalized {
                return false;
            }
        }
        if self.divergent_only && r.status != SlotStatus::Divergent {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Opaque continuation token from a previous page.
    pub cursor: Option<String>,
    pub limit: u16,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Validate for PageRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(ContractViolation::InvalidRange {
                field: "page_request.limit",
                min: 1.0,
                max: MAX_PAGE_LIMIT as f64,
                got: self.limit as f64,
            });
        }
        if let Some(c) = &self.cursor {
            if c.trim().is_empty() || c.len() > 64 {
                return Err(ContractViolation::InvalidValue {
                    field: "page_request.cursor",
                    reason: "must be a non-empty token <= 64 chars",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotListQuery {
    pub inventory_id: InventoryId,
    pub filter: SlotListFilter,
    pub page: PageRequest,
}

impl Validate for SlotListQuery {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.inventory_id.validate()?;
        self.page.validate()
    }
}

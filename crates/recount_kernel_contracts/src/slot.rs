#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::{validate_id, validate_opt_text};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const SLOT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Highest count phase a slot can reach.
pub const MAX_PHASE_COUNT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryId(String);

impl InventoryId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for InventoryId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("inventory_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationCode(String);

impl LocationCode {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for LocationCode {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("location_code", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemCode(String);

impl ItemCode {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ItemCode {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("item_code", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LotCode(String);

impl LotCode {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for LotCode {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("lot", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ActorId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("actor_id", &self.0, 128)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Operator,
    Supervisor,
}

impl ActorRole {
    pub fn is_privileged(self) -> bool {
        matches!(self, ActorRole::Supervisor)
    }
}

/// Caller identity as resolved by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub actor_id: ActorId,
    pub role: ActorRole,
}

impl ActorRef {
    pub fn operator(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            role: ActorRole::Operator,
        }
    }

    pub fn supervisor(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            role: ActorRole::Supervisor,
        }
    }
}

/// Uniqueness key of a slot within one inventory run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub inventory_id: InventoryId,
    pub location_code: LocationCode,
    pub item_code: ItemCode,
    pub lot: Option<LotCode>,
}

impl SlotKey {
    pub fn v1(
        inventory_id: InventoryId,
        location_code: LocationCode,
        item_code: ItemCode,
        lot: Option<LotCode>,
    ) -> Self {
        Self {
            inventory_id,
            location_code,
            item_code,
            lot,
        }
    }
}

impl Validate for SlotKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.inventory_id.validate()?;
        self.location_code.validate()?;
        self.item_code.validate()?;
        if let Some(lot) = &self.lot {
            lot.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotRecordId(pub u64);

impl Validate for SlotRecordId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "record_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Fixed-point count value. Never negative; submissions additionally require > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub fn new(value: Decimal) -> Result<Self, ContractViolation> {
        let q = Self(value);
        q.validate()?;
        Ok(q)
    }

    pub fn value(self) -> Decimal {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl Validate for Quantity {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 < Decimal::ZERO {
            return Err(ContractViolation::InvalidValue {
                field: "quantity",
                reason: "must be >= 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPhase {
    Primary,
    Secondary,
    Tertiary,
}

impl CountPhase {
    pub fn number(self) -> u8 {
        match self {
            CountPhase::Primary => 1,
            CountPhase::Secondary => 2,
            CountPhase::Tertiary => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(CountPhase::Primary),
            2 => Some(CountPhase::Secondary),
            3 => Some(CountPhase::Tertiary),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CountPhase::Primary => "primary",
            CountPhase::Secondary => "secondary",
            CountPhase::Tertiary => "tertiary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Primary,
    Secondary,
    Divergent,
    Tertiary,
    Concluded,
}

impl SlotStatus {
    /// Position in the forward-only lifecycle. Secondary and divergent share a rank.
    pub fn rank(self) -> u8 {
        match self {
            SlotStatus::Primary => 0,
            SlotStatus::Secondary | SlotStatus::Divergent => 1,
            SlotStatus::Tertiary => 2,
            SlotStatus::Concluded => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Primary => "primary",
            SlotStatus::Secondary => "secondary",
            SlotStatus::Divergent => "divergent",
            SlotStatus::Tertiary => "tertiary",
            SlotStatus::Concluded => "concluded",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(SlotStatus::Primary),
            "secondary" => Some(SlotStatus::Secondary),
            "divergent" => Some(SlotStatus::Divergent),
            "tertiary" => Some(SlotStatus::Tertiary),
            "concluded" => Some(SlotStatus::Concluded),
            _ => None,
        }
    }
}

/// Descriptive fields carried through reconciliation unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMetadata {
    pub note: Option<String>,
    pub unit_of_measure: Option<String>,
    pub label: Option<String>,
}

impl SlotMetadata {
    /// Fills fields that are still empty from `incoming`; never overwrites.
    pub fn fill_missing_from(&self, incoming: &SlotMetadata) -> SlotMetadata {
        SlotMetadata {
            note: self.note.clone().or_else(|| incoming.note.clone()),
            unit_of_measure: self
                .unit_of_measure
                .clone()
                .or_else(|| incoming.unit_of_measure.clone()),
            label: self.label.clone().or_else(|| incoming.label.clone()),
        }
    }
}

impl Validate for SlotMetadata {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_opt_text("slot_metadata.note", &self.note, 1024)?;
        validate_opt_text("slot_metadata.unit_of_measure", &self.unit_of_measure, 16)?;
        validate_opt_text("slot_metadata.label", &self.label, 256)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub schema_version: SchemaVersion,
    /// Assigned by the store on insert; zero until then.
    pub record_id: SlotRecordId,
    /// Optimistic concurrency token; bumped by the store on every accepted write.
    pub version: u64,
    #[serde(flatten)]
    pub key: SlotKey,
    pub quantity_primary: Quantity,
    pub quantity_secondary: Option<Quantity>,
    pub quantity_tertiary: Option<Quantity>,
    pub quantity_final: Option<Quantity>,
    pub primary_contributor: ActorId,
    pub secondary_contributor: Option<ActorId>,
    pub tertiary_contributor: Option<ActorId>,
    pub primary_counted_at: MonotonicTimeNs,
    pub secondary_counted_at: Option<MonotonicTimeNs>,
    pub tertiary_counted_at: Option<MonotonicTimeNs>,
    pub status: SlotStatus,
    pub phase_count: u8,
    pub may_advance: bool,
    pub finalized: bool,
    pub finalized_at: Option<MonotonicTimeNs>,
    pub finalized_by: Option<ActorId>,
    #[serde(flatten)]
    pub metadata: SlotMetadata,
}

impl SlotRecord {
    /// Fresh record for the first accepted primary count of `key`.
    pub fn new_primary_v1(
        key: SlotKey,
        quantity: Quantity,
        contributor: ActorId,
        counted_at: MonotonicTimeNs,
        may_advance: bool,
        metadata: SlotMetadata,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: SLOT_CONTRACT_VERSION,
            record_id: SlotRecordId(0),
            version: 0,
            key,
            quantity_primary: quantity,
            quantity_secondary: None,
            quantity_tertiary: None,
            quantity_final: None,
            primary_contributor: contributor,
            secondary_contributor: None,
            tertiary_contributor: None,
            primary_counted_at: counted_at,
            secondary_counted_at: None,
            tertiary_counted_at: None,
            status: SlotStatus::Primary,
            phase_count: 1,
            may_advance,
            finalized: false,
            finalized_at: None,
            finalized_by: None,
            metadata,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn quantity_for(&self, phase: CountPhase) -> Option<Quantity> {
        match phase {
            CountPhase::Primary => Some(self.quantity_primary),
            CountPhase::Secondary => self.quantity_secondary,
            CountPhase::Tertiary => self.quantity_tertiary,
        }
    }

    /// Phase that a submission without an explicit phase targets.
    pub fn next_phase(&self) -> Option<CountPhase> {
        CountPhase::from_number(self.phase_count).and_then(CountPhase::next)
    }

    pub fn is_terminal(&self) -> bool {
        self.finalized || self.status == SlotStatus::Concluded
    }
}

impl Validate for SlotRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SLOT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.schema_version",
                reason: "must match SLOT_CONTRACT_VERSION",
            });
        }
        self.key.validate()?;
        self.primary_contributor.validate()?;
        self.metadata.validate()?;
        if !self.quantity_primary.is_positive() {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.quantity_primary",
                reason: "must be > 0",
            });
        }
        for q in [
            self.quantity_secondary,
            self.quantity_tertiary,
            self.quantity_final,
        ]
        .into_iter()
        .flatten()
        {
            q.validate()?;
        }
        if self.primary_counted_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.primary_counted_at",
                reason: "must be > 0",
            });
        }

        validate_phase_columns(
            "slot_record.secondary",
            self.quantity_secondary.is_some(),
            self.secondary_contributor.as_ref(),
            self.secondary_counted_at.is_some(),
        )?;
        validate_phase_columns(
            "slot_record.tertiary",
            self.quantity_tertiary.is_some(),
            self.tertiary_contributor.as_ref(),
            self.tertiary_counted_at.is_some(),
        )?;
        if self.quantity_tertiary.is_some() && self.quantity_secondary.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.quantity_tertiary",
                reason: "requires quantity_secondary",
            });
        }

        let highest_phase = if self.quantity_tertiary.is_some() {
            3
        } else if self.quantity_secondary.is_some() {
            2
        } else {
            1
        };
        if self.phase_count != highest_phase {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.phase_count",
                reason: "must equal the highest phase with a recorded quantity",
            });
        }

        let status_matches_phase = match self.status {
            SlotStatus::Primary => self.phase_count == 1,
            SlotStatus::Secondary | SlotStatus::Divergent => self.phase_count == 2,
            SlotStatus::Tertiary => self.phase_count == 3,
            SlotStatus::Concluded => self.phase_count >= 2,
        };
        if !status_matches_phase {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.status",
                reason: "inconsistent with phase_count",
            });
        }
        if (self.status == SlotStatus::Concluded) != self.quantity_final.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.quantity_final",
                reason: "must be present iff status is concluded",
            });
        }

        if self.finalized != (self.finalized_at.is_some() && self.finalized_by.is_some()) {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.finalized",
                reason: "finalized_at and finalized_by must be present iff finalized",
            });
        }
        if let Some(by) = &self.finalized_by {
            by.validate()?;
        }
        Ok(())
    }
}

fn validate_phase_columns(
    field: &'static str,
    has_quantity: bool,
    contributor: Option<&ActorId>,
    has_timestamp: bool,
) -> Result<(), ContractViolation> {
    if has_quantity != contributor.is_some() || has_quantity != has_timestamp {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "quantity, contributor and timestamp must be set together",
        });
    }
    if let Some(c) = contributor {
        c.validate()?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotLedgerAction {
    Created,
    PrimaryMerged,
    SecondaryAccepted,
    TertiaryAccepted,
    PhaseReleased,
    Finalized,
}

/// Append-only history row. `record` is the full post-write snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLedgerEvent {
    pub schema_version: SchemaVersion,
    pub event_id: u64,
    pub record_id: SlotRecordId,
    pub action: SlotLedgerAction,
    pub actor_id: ActorId,
    pub recorded_at: MonotonicTimeNs,
    pub record_digest: String,
    pub record: SlotRecord,
}

impl Validate for SlotLedgerEvent {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SLOT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "slot_ledger_event.schema_version",
                reason: "must match SLOT_CONTRACT_VERSION",
            });
        }
        if self.event_id == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "slot_ledger_event.event_id",
                reason: "must be > 0",
            });
        }
        self.record_id.validate()?;
        if self.record.record_id != self.record_id {
            return Err(ContractViolation::InvalidValue {
                field: "slot_ledger_event.record",
                reason: "snapshot must belong to record_id",
            });
        }
        self.actor_id.validate()?;
        validate_id("slot_ledger_event.record_digest", &self.record_digest, 128)?;
        self.record.validate()
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use recount_engines::phase_gate::GatePolicy;
use recount_kernel_contracts::count::{
    FinalizeRequest, PageRequest, ReleasePhaseRequest, SlotListFilter, SlotListQuery,
    SubmitCountRequest, DEFAULT_PAGE_LIMIT,
};
use recount_kernel_contracts::slot::{
    ActorId, ActorRef, CountPhase, InventoryId, ItemCode, LocationCode, LotCode, SlotKey,
    SlotLedgerEvent, SlotMetadata, SlotRecord, SlotRecordId, SlotStatus,
};
use recount_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use recount_os::count_runtime::{CountRuntime, ReconcileConfig};
use recount_os::error::CountError;
use recount_storage::slot_store::SlotStore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

/// Adapter settings resolved from `RECOUNT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub http_bind: String,
    /// `None` keeps the store in memory only.
    pub store_path: Option<PathBuf>,
    pub supervisor_ids: BTreeSet<String>,
    pub reconcile: ReconcileConfig,
    pub log_json: bool,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let http_bind = env_getter("RECOUNT_HTTP_BIND")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let store_path = env_getter("RECOUNT_STORE_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let mut supervisor_ids = BTreeSet::new();
        if let Some(raw) = env_getter("RECOUNT_SUPERVISOR_IDS") {
            for id in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                ActorId::new(id).map_err(|err| {
                    format!("RECOUNT_SUPERVISOR_IDS contains invalid actor id '{id}': {err}")
                })?;
                supervisor_ids.insert(id.to_string());
            }
        }

        let mut reconcile = ReconcileConfig::mvp_v1();
        if let Some(raw) = env_getter("RECOUNT_GATE_POLICY") {
            if !raw.trim().is_empty() {
                reconcile.gate_policy = GatePolicy::parse(&raw).ok_or_else(|| {
                    format!(
                        "RECOUNT_GATE_POLICY must be open_secondary or release_before_secondary, got '{}'",
                        raw.trim()
                    )
                })?;
            }
        }
        if let Some(v) = env_getter("RECOUNT_STORAGE_RETRY_MAX")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v <= 20)
        {
            reconcile.storage_retry_max = v;
        }

        let log_json = match env_getter("RECOUNT_LOG_JSON") {
            Some(v) => matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            ),
            None => false,
        };

        Ok(Self {
            http_bind,
            store_path,
            supervisor_ids,
            reconcile,
            log_json,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCountAdapterRequest {
    pub inventory_id: String,
    pub location_code: String,
    pub item_code: String,
    pub lot: Option<String>,
    pub phase: Option<CountPhase>,
    pub quantity: Decimal,
    pub actor_id: String,
    pub note: Option<String>,
    pub unit_of_measure: Option<String>,
    pub label: Option<String>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePhaseAdapterRequest {
    pub target_phase: CountPhase,
    pub actor_id: String,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeAdapterRequest {
    pub actor_id: String,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLookupParams {
    pub inventory_id: String,
    pub location_code: String,
    pub item_code: String,
    pub lot: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotListParams {
    pub status: Option<String>,
    pub location_code: Option<String>,
    pub item_code: Option<String>,
    pub finalized: Option<bool>,
    pub divergent_only: Option<bool>,
    pub cursor: Option<String>,
    pub limit: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecordAdapterResponse {
    pub status: String,
    pub record: SlotRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAckAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub record_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPageAdapterResponse {
    pub status: String,
    pub items: Vec<SlotRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEventsAdapterResponse {
    pub status: String,
    pub events: Vec<SlotLedgerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub gate_policy: String,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub kind: String,
    pub retryable: bool,
    pub reason: String,
}

/// Transport-neutral failure: an HTTP status code plus the JSON body to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub http_status: u16,
    pub body: AdapterErrorResponse,
}

impl AdapterError {
    fn new(http_status: u16, kind: &str, retryable: bool, reason: String) -> Self {
        Self {
            http_status,
            body: AdapterErrorResponse {
                status: "error".to_string(),
                kind: kind.to_string(),
                retryable,
                reason,
            },
        }
    }

    pub fn bad_request(reason: String) -> Self {
        Self::new(400, "contract_violation", false, reason)
    }

    pub fn internal(reason: String) -> Self {
        Self::new(500, "internal", false, reason)
    }
}

impl From<CountError> for AdapterError {
    fn from(err: CountError) -> Self {
        let http_status = match &err {
            CountError::InvalidQuantity | CountError::ContractViolation(_) => 400,
            CountError::NotAuthorized { .. } => 403,
            CountError::RecordNotFound { .. } => 404,
            CountError::InvalidTransition { .. }
            | CountError::AlreadyAdvanced { .. }
            | CountError::Conflict { .. } => 409,
            CountError::StorageUnavailable(_) => 503,
            CountError::Internal(_) => 500,
        };
        Self::new(
            http_status,
            err.kind(),
            err.transience().is_retryable(),
            err.to_string(),
        )
    }
}

fn field_error(err: ContractViolation) -> AdapterError {
    AdapterError::bad_request(err.to_string())
}

/// HTTP-facing wrapper around the count runtime. Roles come from `RECOUNT_SUPERVISOR_IDS`,
/// never from a role field in the request.
#[derive(Debug)]
pub struct AdapterRuntime {
    runtime: CountRuntime<SlotStore>,
    supervisor_ids: BTreeSet<String>,
    persistent: bool,
}

impl AdapterRuntime {
    pub fn new(config: &AdapterConfig) -> Result<Self, String> {
        let store = match &config.store_path {
            Some(path) => SlotStore::open_journal(path).map_err(|err| {
                format!("failed to open slot store '{}': {err}", path.display())
            })?,
            None => SlotStore::new_in_memory(),
        };
        let runtime = CountRuntime::new(store, config.reconcile)
            .map_err(|err| format!("invalid reconcile config: {err}"))?;
        Ok(Self {
            runtime,
            supervisor_ids: config.supervisor_ids.clone(),
            persistent: config.store_path.is_some(),
        })
    }

    pub fn default_from_env() -> Result<Self, String> {
        Self::new(&AdapterConfig::from_env()?)
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            gate_policy: self.runtime.config().gate_policy.as_str().to_string(),
            persistent: self.persistent,
        }
    }

    /// Maps a caller-supplied actor id to a role. The id itself is not authenticated here;
    /// deployments must put an authenticating proxy in front of this adapter.
    fn resolve_actor(&self, raw: &str) -> Result<ActorRef, AdapterError> {
        let actor_id = ActorId::new(raw.trim()).map_err(field_error)?;
        if self.supervisor_ids.contains(actor_id.as_str()) {
            Ok(ActorRef::supervisor(actor_id))
        } else {
            Ok(ActorRef::operator(actor_id))
        }
    }

    pub fn submit_count(
        &self,
        request: SubmitCountAdapterRequest,
    ) -> Result<SlotRecordAdapterResponse, AdapterError> {
        let key = parse_slot_key(
            &request.inventory_id,
            &request.location_code,
            &request.item_code,
            request.lot.as_deref(),
        )?;
        let req = SubmitCountRequest::v1(
            key,
            request.phase,
            request.quantity,
            self.resolve_actor(&request.actor_id)?,
            SlotMetadata {
                note: request.note,
                unit_of_measure: request.unit_of_measure,
                label: request.label,
            },
            now_or_clock(request.now_ns),
        )
        .map_err(field_error)?;
        let record = self.runtime.submit_count(&req)?;
        Ok(SlotRecordAdapterResponse {
            status: "ok".to_string(),
            record,
        })
    }

    pub fn release_phase(
        &self,
        record_id: u64,
        request: ReleasePhaseAdapterRequest,
    ) -> Result<SlotAckAdapterResponse, AdapterError> {
        let req = ReleasePhaseRequest::v1(
            SlotRecordId(record_id),
            request.target_phase,
            self.resolve_actor(&request.actor_id)?,
            now_or_clock(request.now_ns),
        )
        .map_err(field_error)?;
        self.runtime.release_phase(&req)?;
        Ok(ack("PHASE_RELEASED", record_id))
    }

    pub fn finalize(
        &self,
        record_id: u64,
        request: FinalizeAdapterRequest,
    ) -> Result<SlotAckAdapterResponse, AdapterError> {
        let req = FinalizeRequest::v1(
            SlotRecordId(record_id),
            self.resolve_actor(&request.actor_id)?,
            now_or_clock(request.now_ns),
        )
        .map_err(field_error)?;
        self.runtime.finalize(&req)?;
        Ok(ack("FINALIZED", record_id))
    }

    pub fn lookup(
        &self,
        params: &SlotLookupParams,
    ) -> Result<SlotRecordAdapterResponse, AdapterError> {
        let key = parse_slot_key(
            &params.inventory_id,
            &params.location_code,
            &params.item_code,
            params.lot.as_deref(),
        )?;
        let record = self.runtime.get_record(&key)?.ok_or_else(|| {
            AdapterError::new(404, "record_not_found", false, "no record for slot".to_string())
        })?;
        Ok(SlotRecordAdapterResponse {
            status: "ok".to_string(),
            record,
        })
    }

    pub fn get_slot(&self, record_id: u64) -> Result<SlotRecordAdapterResponse, AdapterError> {
        let record = self
            .runtime
            .get_record_by_id(SlotRecordId(record_id))?
            .ok_or(CountError::RecordNotFound { record_id })?;
        Ok(SlotRecordAdapterResponse {
            status: "ok".to_string(),
            record,
        })
    }

    pub fn slot_events(&self, record_id: u64) -> Result<SlotEventsAdapterResponse, AdapterError> {
        let events = self.runtime.slot_events(SlotRecordId(record_id))?;
        if events.is_empty() {
            return Err(CountError::RecordNotFound { record_id }.into());
        }
        Ok(SlotEventsAdapterResponse {
            status: "ok".to_string(),
            events,
        })
    }

    pub fn list_slots(
        &self,
        inventory_id: &str,
        params: SlotListParams,
    ) -> Result<SlotPageAdapterResponse, AdapterError> {
        let status = params
            .status
            .as_deref()
            .map(|raw| {
                SlotStatus::parse(raw)
                    .ok_or_else(|| AdapterError::bad_request(format!("unknown status '{raw}'")))
            })
            .transpose()?;
        let query = SlotListQuery {
            inventory_id: InventoryId::new(inventory_id.trim()).map_err(field_error)?,
            filter: SlotListFilter {
                status,
                location_code: params
                    .location_code
                    .map(LocationCode::new)
                    .transpose()
                    .map_err(field_error)?,
                item_code: params
                    .item_code
                    .map(ItemCode::new)
                    .transpose()
                    .map_err(field_error)?,
                finalized: params.finalized,
                divergent_only: params.divergent_only.unwrap_or(false),
            },
            page: PageRequest {
                cursor: params.cursor,
                limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            },
        };
        let page = self.runtime.list_records(&query)?;
        Ok(SlotPageAdapterResponse {
            status: "ok".to_string(),
            items: page.items,
            next_cursor: page.next_cursor,
        })
    }
}

fn ack(outcome: &str, record_id: u64) -> SlotAckAdapterResponse {
    SlotAckAdapterResponse {
        status: "ok".to_string(),
        outcome: outcome.to_string(),
        record_id,
    }
}

fn parse_slot_key(
    inventory_id: &str,
    location_code: &str,
    item_code: &str,
    lot: Option<&str>,
) -> Result<SlotKey, AdapterError> {
    let lot = lot
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(LotCode::new)
        .transpose()
        .map_err(field_error)?;
    Ok(SlotKey::v1(
        InventoryId::new(inventory_id.trim()).map_err(field_error)?,
        LocationCode::new(location_code.trim()).map_err(field_error)?,
        ItemCode::new(item_code.trim()).map_err(field_error)?,
        lot,
    ))
}

fn now_or_clock(now_ns: Option<u64>) -> MonotonicTimeNs {
    MonotonicTimeNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    if nanos > u64::MAX as u128 {
        u64::MAX
    } else {
        nanos as u64
    }
}

#![forbid(unsafe_code)]

use recount_engines::EngineError;
use recount_kernel_contracts::count::CountRefusal;
use recount_kernel_contracts::slot::SlotStatus;
use recount_kernel_contracts::ContractViolation;
use recount_storage::slot_store::StorageError;

/// Whether retrying the same call can succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs or state.
    Permanent,
    /// Contention or a transient outage; the same call may succeed later.
    Retryable,
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CountError {
    #[error("quantity must be > 0")]
    InvalidQuantity,
    #[error("not authorized: {reason}")]
    NotAuthorized { reason: &'static str },
    #[error("invalid transition: {reason}")]
    InvalidTransition { reason: &'static str },
    #[error("slot already advanced past primary (status={})", .status.as_str())]
    AlreadyAdvanced { status: SlotStatus },
    #[error("conflicting concurrent write: {detail}")]
    Conflict { detail: String },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("slot record {record_id} not found")]
    RecordNotFound { record_id: u64 },
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
    #[error("storage invariant broken: {0}")]
    Internal(String),
}

impl CountError {
    pub fn kind(&self) -> &'static str {
        match self {
            CountError::InvalidQuantity => "invalid_quantity",
            CountError::NotAuthorized { .. } => "not_authorized",
            CountError::InvalidTransition { .. } => "invalid_transition",
            CountError::AlreadyAdvanced { .. } => "already_advanced",
            CountError::Conflict { .. } => "conflict",
            CountError::StorageUnavailable(_) => "storage_unavailable",
            CountError::RecordNotFound { .. } => "record_not_found",
            CountError::ContractViolation(_) => "contract_violation",
            CountError::Internal(_) => "internal",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            CountError::Conflict { .. } | CountError::StorageUnavailable(_) => {
                Transience::Retryable
            }
            CountError::Internal(_) => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }
}

impl From<CountRefusal> for CountError {
    fn from(v: CountRefusal) -> Self {
        match v {
            CountRefusal::InvalidQuantity => CountError::InvalidQuantity,
            CountRefusal::NotAuthorized { reason } => CountError::NotAuthorized { reason },
            CountRefusal::InvalidTransition { reason } => CountError::InvalidTransition { reason },
            CountRefusal::AlreadyAdvanced { status } => CountError::AlreadyAdvanced { status },
        }
    }
}

impl From<EngineError> for CountError {
    fn from(v: EngineError) -> Self {
        match v {
            EngineError::Refused(r) => r.into(),
            EngineError::Contract(c) => CountError::ContractViolation(c),
        }
    }
}

impl From<ContractViolation> for CountError {
    fn from(v: ContractViolation) -> Self {
        CountError::ContractViolation(v)
    }
}

impl From<StorageError> for CountError {
    fn from(v: StorageError) -> Self {
        match v {
            e @ (StorageError::DuplicateKey { .. } | StorageError::VersionConflict { .. }) => {
                CountError::Conflict {
                    detail: e.to_string(),
                }
            }
            StorageError::NotFound { key, .. } => CountError::RecordNotFound {
                record_id: key.parse().unwrap_or(0),
            },
            StorageError::SealedRecord { .. } => CountError::InvalidTransition {
                reason: "record is finalized",
            },
            StorageError::StatusRegression { .. } => CountError::InvalidTransition {
                reason: "status cannot move backwards",
            },
            StorageError::Unavailable(msg) => CountError::StorageUnavailable(msg),
            StorageError::ContractViolation(c) => CountError::ContractViolation(c),
            e @ (StorageError::AppendOnlyViolation { .. }
            | StorageError::CorruptJournal { .. }
            | StorageError::TornJournal { .. }
            | StorageError::Poisoned) => CountError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_count_error_01_only_contention_and_outages_are_retryable() {
        let retryable = [
            CountError::Conflict {
                detail: "x".to_string(),
            },
            CountError::StorageUnavailable("down".to_string()),
        ];
        for e in retryable {
            assert!(e.transience().is_retryable(), "{}", e.kind());
        }
        let permanent = [
            CountError::InvalidQuantity,
            CountError::NotAuthorized { reason: "r" },
            CountError::InvalidTransition { reason: "r" },
            CountError::AlreadyAdvanced {
                status: SlotStatus::Divergent,
            },
            CountError::RecordNotFound { record_id: 1 },
        ];
        for e in permanent {
            assert_eq!(e.transience(), Transience::Permanent, "{}", e.kind());
        }
    }

    #[test]
    fn at_count_error_02_storage_errors_map_to_count_kinds() {
        let e: CountError = StorageError::VersionConflict {
            record_id: 3,
            expected: 1,
            found: 2,
        }
        .into();
        assert_eq!(e.kind(), "conflict");
        let e: CountError = StorageError::SealedRecord { record_id: 3 }.into();
        assert_eq!(e.kind(), "invalid_transition");
        let e: CountError = StorageError::NotFound {
            table: "slot_current",
            key: "9".to_string(),
        }
        .into();
        assert!(matches!(e, CountError::RecordNotFound { record_id: 9 }));
        let e: CountError = StorageError::Unavailable("disk".to_string()).into();
        assert!(e.transience().is_retryable());
        for fatal in [
            StorageError::Poisoned,
            StorageError::TornJournal {
                path: "/tmp/j.jsonl".to_string(),
                reason: "truncate failed".to_string(),
            },
        ] {
            let e: CountError = fatal.into();
            assert_eq!(e.kind(), "internal");
            assert!(!e.transience().is_retryable());
        }
    }
}

#![forbid(unsafe_code)]

use recount_kernel_contracts::count::CountRefusal;
use recount_kernel_contracts::ContractViolation;

pub mod aggregate;
pub mod phase_gate;
pub mod reconcile;
pub mod seal;

/// Why an engine declined to produce a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Refused(CountRefusal),
    Contract(ContractViolation),
}

impl From<CountRefusal> for EngineError {
    fn from(v: CountRefusal) -> Self {
        EngineError::Refused(v)
    }
}

impl From<ContractViolation> for EngineError {
    fn from(v: ContractViolation) -> Self {
        EngineError::Contract(v)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Refused(r) => write!(f, "{r}"),
            EngineError::Contract(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for EngineError {}

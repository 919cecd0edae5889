#![forbid(unsafe_code)]

pub mod common;
pub mod count;
pub mod slot;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

#![forbid(unsafe_code)]

pub mod count_runtime;
pub mod error;
pub mod notify;

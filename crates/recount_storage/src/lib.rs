#![forbid(unsafe_code)]

pub mod repo;
pub mod slot_store;

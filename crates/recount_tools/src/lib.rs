#![forbid(unsafe_code)]

pub mod journal_cli;

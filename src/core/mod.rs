//! Core domain types: identifiers and schedule calculation.

pub mod schedule;
pub mod types;

//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod invariants;
pub mod json_recovery;
pub mod patch;
pub mod plan;
pub mod plan_parser;
pub mod role;
pub mod status;
pub mod types;

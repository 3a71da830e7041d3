//! Sluice Core
//!
//! Core types and pure logic for the Sluice pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: pipeline definitions and the activity (run) state tree
//! - DTOs: data exchanged with callers of the trigger API
//! - Condition evaluation over run-scoped variables
//! - Cron schedule computation

pub mod condition;
pub mod domain;
pub mod dto;
pub mod schedule;

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

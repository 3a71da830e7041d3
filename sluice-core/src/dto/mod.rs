//! Data Transfer Objects for the trigger API
//!
//! This module contains DTOs exchanged between the orchestrator service layer
//! and its callers (HTTP layer, pollers, event subscribers). DTOs are thin
//! request/response shapes around the domain types.

pub mod activity;
pub mod event;

//! Sluice Orchestrator
//!
//! Runs multi-stage pipelines on an execution backend and keeps each run's
//! state tree in step with what the backend reports.
//!
//! Architecture:
//! - Engine: the driver (pushes runs forward), the reconciler (pulls backend
//!   progress back) and cleanup hooks
//! - Store: JSON documents in PostgreSQL or in memory
//! - Repositories: typed access to pipelines and activities
//! - Services: the trigger API and pipeline bookkeeping
//! - Scheduler: the sync poller and the cron loop

pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod locks;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;

pub use state::AppState;

//! Sluice Execution Backends
//!
//! The seam between the orchestrator and whatever actually runs the work.
//!
//! The orchestrator only ever talks to an [`ExecutionBackend`]: it provisions
//! one unit of work per step, triggers units, inspects their progress and
//! cancels them. Everything backend-specific (job descriptors, shell bodies,
//! credentials) stays behind the trait.
//!
//! This crate provides:
//! - [`ExecutionBackend`]: the port
//! - [`segment`]: turning timestamped unit output into per-step segments
//! - [`rest::RestBackend`]: an adapter for a CI server's REST API
//! - `FakeBackend`: a scripted in-memory backend (`test-support` feature)
//!
//! # Example
//!
//! ```no_run
//! use sluice_backend::ExecutionBackend;
//! use sluice_backend::rest::{BackendConfig, RestBackend};
//!
//! # async fn example() -> sluice_backend::Result<()> {
//! let backend = RestBackend::new(BackendConfig::new("http://jenkins:8080"))?;
//! let workers = backend.active_workers().await?;
//! println!("{} workers online", workers.len());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod rest;
pub mod segment;
mod unit;

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{BackendCall, FakeBackend};

pub use error::{BackendError, Result};
pub use unit::{Handle, InfoSnapshot, UnitRef, UnitResult, UnitState};

use async_trait::async_trait;
use sluice_core::domain::activity::Activity;
use std::collections::BTreeMap;

/// Capabilities the orchestrator needs from an execution backend
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Provisions the unit of work for one step
    ///
    /// Idempotent: calling it again updates the existing unit, which is how
    /// reruns pick up a new worker or a pinned commit.
    async fn prepare(&self, activity: &Activity, stage: usize, step: usize) -> Result<UnitRef>;

    /// Starts a unit
    async fn trigger(&self, unit: &UnitRef, params: &BTreeMap<String, String>) -> Result<Handle>;

    /// Current state of a unit, `None` when the backend has nothing for it yet
    ///
    /// A stage unit reports the combined output of its step units.
    async fn inspect(&self, unit: &UnitRef) -> Result<Option<InfoSnapshot>>;

    /// Cancels a queued or running unit
    async fn cancel(&self, handle: &Handle) -> Result<()>;

    /// Deletes the last run of a unit
    async fn delete_artifact(&self, unit: &UnitRef) -> Result<()>;

    /// Names of workers that can take work right now
    async fn active_workers(&self) -> Result<Vec<String>>;

    /// Raw output of the last run of a unit, starting at `start_line`
    async fn fetch_log(&self, unit: &UnitRef, start_line: usize) -> Result<String>;

    /// Runs a shell command on a worker and returns its output
    async fn exec_on_worker(&self, node: &str, command: &str) -> Result<String>;
}

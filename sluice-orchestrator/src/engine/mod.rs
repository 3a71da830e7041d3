//! Execution engine
//!
//! The driver pushes an activity forward when something is decided on the
//! orchestrator side (a run is requested, a stage is approved, a step is
//! stopped). The reconciler pulls the backend's view of running units back
//! into the activity tree. Both mutate the tree in place; persisting it is the
//! caller's job.

pub mod cleanup;
pub mod driver;
pub mod reconciler;

pub use cleanup::{CleanupError, CleanupHook, ServiceContainerCleanup, WorkspaceCleanup};
pub use driver::Driver;
pub use reconciler::Reconciler;

use sluice_backend::BackendError;
use sluice_core::condition::ConditionError;
use sluice_core::domain::activity::ShapeError;
use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// The definition cannot be executed as written
    #[error("invalid definition: {0}")]
    Definition(String),

    #[error("no active worker available")]
    NoWorkerAvailable,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("stage {stage} step {step:?} does not exist")]
    OutOfRange { stage: usize, step: Option<usize> },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<ConditionError> for EngineError {
    fn from(err: ConditionError) -> Self {
        EngineError::Definition(err.to_string())
    }
}

impl From<ShapeError> for EngineError {
    fn from(err: ShapeError) -> Self {
        EngineError::Definition(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

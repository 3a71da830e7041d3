//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories and the engine.

pub mod activity;
pub mod pipeline;

// Re-export for convenience
pub use activity as activity_service;
pub use pipeline as pipeline_service;

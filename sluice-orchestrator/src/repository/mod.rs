//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository maps a domain entity onto the document store.

pub mod activity;
pub mod pipeline;

// Re-export for convenience
pub use activity as activity_repository;
pub use pipeline as pipeline_repository;

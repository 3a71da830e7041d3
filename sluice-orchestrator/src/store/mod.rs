//! Document store
//!
//! Pipelines and activities are persisted as JSON documents addressed by
//! `(kind, key)`. The orchestrator only needs create, update, delete, get and
//! list; anything that can do those can hold its state.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgDocumentStore;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: String },

    #[error("{kind} {key} already exists")]
    Conflict { kind: Kind, key: String },
}

/// Kind of stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Pipeline,
    Activity,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Pipeline => "pipeline",
            Kind::Activity => "activity",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: Kind,
    pub key: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the key is taken
    async fn create(&self, kind: Kind, key: &str, data: serde_json::Value) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when there is nothing to replace
    async fn update(&self, kind: Kind, key: &str, data: serde_json::Value) -> Result<(), StoreError>;

    async fn delete(&self, kind: Kind, key: &str) -> Result<(), StoreError>;

    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Record>, StoreError>;

    /// Every document of `kind`, ordered by key
    async fn list(&self, kind: Kind) -> Result<Vec<Record>, StoreError>;
}

//! Pipeline Repository
//!
//! Stores pipeline definitions as documents keyed by pipeline id.

use sluice_core::domain::pipeline::Pipeline;

use crate::store::{DocumentStore, Kind, StoreError};

/// Insert a new pipeline
pub async fn create(store: &dyn DocumentStore, pipeline: &Pipeline) -> Result<(), StoreError> {
    store
        .create(Kind::Pipeline, &pipeline.id, serde_json::to_value(pipeline)?)
        .await
}

/// Replace a stored pipeline
pub async fn update(store: &dyn DocumentStore, pipeline: &Pipeline) -> Result<(), StoreError> {
    store
        .update(Kind::Pipeline, &pipeline.id, serde_json::to_value(pipeline)?)
        .await
}

pub async fn delete(store: &dyn DocumentStore, id: &str) -> Result<(), StoreError> {
    store.delete(Kind::Pipeline, id).await
}

/// Find a pipeline by ID
pub async fn find_by_id(store: &dyn DocumentStore, id: &str) -> Result<Option<Pipeline>, StoreError> {
    match store.get(Kind::Pipeline, id).await? {
        Some(record) => Ok(Some(serde_json::from_value(record.data)?)),
        None => Ok(None),
    }
}

/// List all pipelines
pub async fn list_all(store: &dyn DocumentStore) -> Result<Vec<Pipeline>, StoreError> {
    store
        .list(Kind::Pipeline)
        .await?
        .into_iter()
        .map(|r| serde_json::from_value(r.data).map_err(StoreError::from))
        .collect()
}

//! Activity Repository
//!
//! Stores activities, each with its embedded pipeline snapshot, as documents
//! keyed by activity id.

use sluice_core::domain::activity::Activity;

use crate::store::{DocumentStore, Kind, StoreError};

/// Insert a new activity
pub async fn create(store: &dyn DocumentStore, activity: &Activity) -> Result<(), StoreError> {
    store
        .create(Kind::Activity, &activity.id, serde_json::to_value(activity)?)
        .await
}

/// Replace a stored activity
pub async fn update(store: &dyn DocumentStore, activity: &Activity) -> Result<(), StoreError> {
    store
        .update(Kind::Activity, &activity.id, serde_json::to_value(activity)?)
        .await
}

pub async fn delete(store: &dyn DocumentStore, id: &str) -> Result<(), StoreError> {
    store.delete(Kind::Activity, id).await
}

/// Find an activity by ID
pub async fn find_by_id(store: &dyn DocumentStore, id: &str) -> Result<Option<Activity>, StoreError> {
    match store.get(Kind::Activity, id).await? {
        Some(record) => Ok(Some(serde_json::from_value(record.data)?)),
        None => Ok(None),
    }
}

/// List all activities, newest first
pub async fn list_all(store: &dyn DocumentStore) -> Result<Vec<Activity>, StoreError> {
    let mut activities: Vec<Activity> = store
        .list(Kind::Activity)
        .await?
        .into_iter()
        .map(|r| serde_json::from_value(r.data))
        .collect::<Result<_, _>>()?;
    activities.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
    Ok(activities)
}

/// Activities of one pipeline, newest first
pub async fn find_by_pipeline(
    store: &dyn DocumentStore,
    pipeline_id: &str,
) -> Result<Vec<Activity>, StoreError> {
    let mut activities = list_all(store).await?;
    activities.retain(|a| a.pipeline.id == pipeline_id);
    Ok(activities)
}

/// Activities that have not reached a terminal status
pub async fn find_unfinished(store: &dyn DocumentStore) -> Result<Vec<Activity>, StoreError> {
    let mut activities = list_all(store).await?;
    activities.retain(|a| !a.is_terminal());
    Ok(activities)
}

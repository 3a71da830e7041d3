//! Pipeline Service
//!
//! Business logic for pipeline management and run bookkeeping.

use chrono::Utc;
use sluice_core::condition::Predicate;
use sluice_core::domain::activity::Activity;
use sluice_core::domain::pipeline::{Conditions, Pipeline};
use sluice_core::dto::event::ChangeAction;
use sluice_core::schedule;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::pipeline_repository;
use crate::state::AppState;
use crate::store::StoreError;

/// Service error type
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline {0} not found")]
    NotFound(String),

    #[error("invalid pipeline: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Create a new pipeline
///
/// An empty id is replaced by a generated one. Run counters start from zero.
pub async fn create_pipeline(state: &AppState, mut pipeline: Pipeline) -> Result<Pipeline> {
    validate_pipeline(&pipeline)?;

    if pipeline.id.is_empty() {
        pipeline.id = Uuid::new_v4().simple().to_string();
    }
    pipeline.run_count = 0;
    pipeline.last_run_id = None;
    pipeline.last_run_status = None;
    pipeline.last_run_time = 0;
    pipeline.next_run_time = schedule::next_run_time(&pipeline, Utc::now());

    pipeline_repository::create(state.store(), &pipeline).await?;
    state
        .events
        .pipeline_changed(&pipeline.id, ChangeAction::Create);

    tracing::info!("Pipeline created: {} ({})", pipeline.name, pipeline.id);

    Ok(pipeline)
}

/// Get a pipeline by ID
pub async fn get_pipeline(state: &AppState, id: &str) -> Result<Pipeline> {
    pipeline_repository::find_by_id(state.store(), id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(id.to_string()))
}

/// List all pipelines
pub async fn list_pipelines(state: &AppState) -> Result<Vec<Pipeline>> {
    let pipelines = pipeline_repository::list_all(state.store()).await?;
    Ok(pipelines)
}

/// Replace a pipeline's definition, keeping its run history
pub async fn update_pipeline(state: &AppState, mut pipeline: Pipeline) -> Result<Pipeline> {
    validate_pipeline(&pipeline)?;

    let existing = get_pipeline(state, &pipeline.id).await?;
    pipeline.run_count = existing.run_count;
    pipeline.last_run_id = existing.last_run_id;
    pipeline.last_run_status = existing.last_run_status;
    pipeline.last_run_time = existing.last_run_time;
    pipeline.next_run_time = schedule::next_run_time(&pipeline, Utc::now());

    pipeline_repository::update(state.store(), &pipeline).await?;
    state
        .events
        .pipeline_changed(&pipeline.id, ChangeAction::Update);

    tracing::info!("Pipeline updated: {} ({})", pipeline.name, pipeline.id);

    Ok(pipeline)
}

/// Delete a pipeline; its activities are kept
pub async fn delete_pipeline(state: &AppState, id: &str) -> Result<()> {
    match pipeline_repository::delete(state.store(), id).await {
        Ok(()) => {}
        Err(StoreError::NotFound { .. }) => return Err(PipelineError::NotFound(id.to_string())),
        Err(e) => return Err(e.into()),
    }
    state.events.pipeline_changed(id, ChangeAction::Delete);

    tracing::info!("Pipeline deleted: {}", id);

    Ok(())
}

/// Turn time-based triggering on or off
pub async fn set_active(state: &AppState, id: &str, active: bool) -> Result<Pipeline> {
    let mut pipeline = get_pipeline(state, id).await?;
    pipeline.is_activate = active;
    validate_pipeline(&pipeline)?;
    pipeline.next_run_time = schedule::next_run_time(&pipeline, Utc::now());

    pipeline_repository::update(state.store(), &pipeline).await?;
    state.events.pipeline_changed(id, ChangeAction::Update);

    tracing::info!(
        "Pipeline {} {}",
        id,
        if active { "activated" } else { "deactivated" }
    );

    Ok(pipeline)
}

/// Active pipelines whose next scheduled run is at or before `now` (epoch millis)
pub async fn due_pipelines(state: &AppState, now: i64) -> Result<Vec<Pipeline>> {
    let mut pipelines = list_pipelines(state).await?;
    pipelines.retain(|p| p.is_activate && p.next_run_time > 0 && p.next_run_time <= now);
    Ok(pipelines)
}

/// Records a started (or restarted) run on its pipeline
pub async fn record_run(state: &AppState, activity: &Activity) -> Result<Pipeline> {
    let mut pipeline = get_pipeline(state, &activity.pipeline.id).await?;
    pipeline.run_count = pipeline.run_count.max(activity.run_sequence);
    pipeline.last_run_id = Some(activity.id.clone());
    pipeline.last_run_status = Some(activity.status);
    pipeline.last_run_time = activity.start_ts;
    pipeline.next_run_time = schedule::next_run_time(&pipeline, Utc::now());

    pipeline_repository::update(state.store(), &pipeline).await?;
    state
        .events
        .pipeline_changed(&pipeline.id, ChangeAction::Update);

    Ok(pipeline)
}

/// Mirrors the status of the pipeline's latest run
///
/// Does nothing when `activity` is not the latest run or the pipeline is gone.
pub async fn record_status(state: &AppState, activity: &Activity) -> Result<()> {
    let Some(mut pipeline) = pipeline_repository::find_by_id(state.store(), &activity.pipeline.id).await? else {
        return Ok(());
    };
    if pipeline.last_run_id.as_deref() != Some(activity.id.as_str())
        || pipeline.last_run_status == Some(activity.status)
    {
        return Ok(());
    }

    pipeline.last_run_status = Some(activity.status);
    pipeline_repository::update(state.store(), &pipeline).await?;
    state
        .events
        .pipeline_changed(&pipeline.id, ChangeAction::Update);
    Ok(())
}

/// Recomputes the next scheduled run from now
pub async fn reschedule(state: &AppState, id: &str) -> Result<Pipeline> {
    let mut pipeline = get_pipeline(state, id).await?;
    pipeline.next_run_time = schedule::next_run_time(&pipeline, Utc::now());
    pipeline_repository::update(state.store(), &pipeline).await?;
    Ok(pipeline)
}

/// Checks that a pipeline can be saved and run
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<()> {
    if pipeline.name.trim().is_empty() {
        return Err(PipelineError::ValidationError(
            "Pipeline name cannot be empty".to_string(),
        ));
    }

    if pipeline.stages.is_empty() {
        return Err(PipelineError::ValidationError(
            "Pipeline needs at least one stage".to_string(),
        ));
    }

    for stage in &pipeline.stages {
        if stage.steps.is_empty() {
            return Err(PipelineError::ValidationError(format!(
                "Stage '{}' has no steps",
                stage.name
            )));
        }
        validate_conditions(stage.conditions.as_ref())?;
        for step in &stage.steps {
            validate_conditions(step.conditions.as_ref())?;
        }
    }

    if pipeline.is_activate {
        schedule::try_next_run_time(pipeline, Utc::now())
            .map_err(|e| PipelineError::ValidationError(e.to_string()))?;
    }

    Ok(())
}

fn validate_conditions(conditions: Option<&Conditions>) -> Result<()> {
    let Some(conditions) = conditions else {
        return Ok(());
    };
    for predicate in conditions.all.iter().chain(&conditions.any) {
        Predicate::parse(predicate).map_err(|e| PipelineError::ValidationError(e.to_string()))?;
    }
    Ok(())
}

//! Activity Service
//!
//! The trigger API: start, rerun, stop and approve runs, read step output and
//! bring a run up to date with the backend. Every call that changes an
//! activity holds that activity's lock from load to save.

use sluice_backend::UnitRef;
use sluice_backend::segment::trim_first_line;
use sluice_core::domain::activity::Activity;
use sluice_core::domain::pipeline::StepType;
use sluice_core::dto::activity::{RunPipeline, StepLog, StepLogRequest};
use sluice_core::dto::event::ChangeAction;
use thiserror::Error;

use crate::engine::EngineError;
use crate::repository::{activity_repository, pipeline_repository};
use crate::service::pipeline::{self as pipeline_service, PipelineError};
use crate::state::AppState;
use crate::store::StoreError;

/// Service error type
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity {0} not found")]
    NotFound(String),

    #[error("pipeline {0} not found")]
    PipelineNotFound(String),

    #[error("invalid pipeline: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PipelineError> for ActivityError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(id) => ActivityError::PipelineNotFound(id),
            PipelineError::ValidationError(msg) => ActivityError::ValidationError(msg),
            PipelineError::Store(e) => ActivityError::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ActivityError>;

/// Start a new run of a pipeline
pub async fn run_pipeline(state: &AppState, req: RunPipeline) -> Result<Activity> {
    let pipeline = pipeline_repository::find_by_id(state.store(), &req.pipeline_id)
        .await?
        .ok_or_else(|| ActivityError::PipelineNotFound(req.pipeline_id.clone()))?;
    pipeline_service::validate_pipeline(&pipeline)?;

    let activity = state
        .driver
        .run_pipeline(&pipeline, req.trigger_type)
        .await?;

    activity_repository::create(state.store(), &activity).await?;
    state
        .events
        .activity_changed(&activity.id, ChangeAction::Create);
    pipeline_service::record_run(state, &activity).await?;

    tracing::info!(
        "Activity {} started for pipeline {} ({})",
        activity.id,
        pipeline.id,
        activity.trigger_type
    );

    Ok(activity)
}

/// Run a finished activity again under the same id
pub async fn rerun_activity(state: &AppState, id: &str) -> Result<Activity> {
    let _guard = state.locks.lock(id).await;
    let mut activity = load(state, id).await?;

    let pipeline = pipeline_repository::find_by_id(state.store(), &activity.pipeline.id).await?;
    if let Some(pipeline) = &pipeline {
        activity.pipeline.run_count = pipeline.run_count;
    }

    state.driver.rerun_activity(&mut activity).await?;
    save(state, &activity).await?;
    if pipeline.is_some() {
        pipeline_service::record_run(state, &activity).await?;
    }

    tracing::info!("Activity {} rerun as run {}", id, activity.run_sequence);

    Ok(activity)
}

/// Abort a running activity
pub async fn stop_activity(state: &AppState, id: &str) -> Result<Activity> {
    let _guard = state.locks.lock(id).await;
    let mut activity = load(state, id).await?;
    if activity.is_terminal() {
        return Ok(activity);
    }

    state.driver.stop_activity(&mut activity).await?;
    save(state, &activity).await?;
    pipeline_service::record_status(state, &activity).await?;

    Ok(activity)
}

/// Release the stage an activity is waiting on
pub async fn approve_activity(state: &AppState, id: &str) -> Result<Activity> {
    let _guard = state.locks.lock(id).await;
    let mut activity = load(state, id).await?;

    state.driver.approve_activity(&mut activity).await?;
    save(state, &activity).await?;
    pipeline_service::record_status(state, &activity).await?;

    Ok(activity)
}

/// Bring an activity up to date with the backend; returns whether it changed
pub async fn sync_activity(state: &AppState, id: &str) -> Result<bool> {
    let _guard = state.locks.lock(id).await;
    let mut activity = load(state, id).await?;
    if activity.is_terminal() {
        return Ok(false);
    }

    let changed = state.reconciler.sync(&mut activity).await?;
    if changed {
        save(state, &activity).await?;
        pipeline_service::record_status(state, &activity).await?;
    }
    Ok(changed)
}

/// Output of one step, continuing from the caller's previous cursor
pub async fn get_step_log(state: &AppState, req: StepLogRequest) -> Result<StepLog> {
    let activity = load(state, &req.activity_id).await?;
    let def = activity
        .step_def(req.stage, req.step)
        .ok_or(EngineError::OutOfRange {
            stage: req.stage,
            step: Some(req.step),
        })?;
    let checkout = def.step_type() == StepType::Scm;

    // Only whole lines are kept; a trailing partial line is fetched again.
    let known = match req.cursor.rfind('\n') {
        Some(end) => &req.cursor[..=end],
        None => "",
    };
    let start_line = known.matches('\n').count();

    let unit = UnitRef::step(&activity, req.stage, req.step);
    let fetched = match state.driver.backend().fetch_log(&unit, start_line).await {
        Ok(text) => text,
        Err(e) if e.is_not_found() => String::new(),
        Err(e) => return Err(EngineError::from(e).into()),
    };
    let cursor = format!("{known}{fetched}");

    let segmentation = state.reconciler.segmenter().segment(&cursor);
    let text = if checkout {
        segmentation.preamble.text(&cursor).to_string()
    } else {
        segmentation
            .invocations
            .first()
            .map(|s| trim_first_line(s.text(&cursor)).to_string())
            .unwrap_or_default()
    };

    Ok(StepLog { text, cursor })
}

/// Get an activity by ID
pub async fn get_activity(state: &AppState, id: &str) -> Result<Activity> {
    load(state, id).await
}

/// List all activities, newest first
pub async fn list_activities(state: &AppState) -> Result<Vec<Activity>> {
    let activities = activity_repository::list_all(state.store()).await?;
    Ok(activities)
}

/// List activities by pipeline, newest first
pub async fn list_activities_by_pipeline(state: &AppState, pipeline_id: &str) -> Result<Vec<Activity>> {
    let activities = activity_repository::find_by_pipeline(state.store(), pipeline_id).await?;
    Ok(activities)
}

/// Activities still waiting, pending or building
pub async fn list_unfinished(state: &AppState) -> Result<Vec<Activity>> {
    let activities = activity_repository::find_unfinished(state.store()).await?;
    Ok(activities)
}

async fn load(state: &AppState, id: &str) -> Result<Activity> {
    activity_repository::find_by_id(state.store(), id)
        .await?
        .ok_or_else(|| ActivityError::NotFound(id.to_string()))
}

async fn save(state: &AppState, activity: &Activity) -> Result<()> {
    activity_repository::update(state.store(), activity).await?;
    state
        .events
        .activity_changed(&activity.id, ChangeAction::Update);
    Ok(())
}

//! Cron scheduler
//!
//! Starts runs of time-based pipelines once their next run time has passed.
//! A failed start still moves the pipeline to its next occurrence so one bad
//! tick is not retried every interval.

use anyhow::{Context, Result};
use sluice_core::domain::pipeline::TriggerType;
use sluice_core::dto::activity::RunPipeline;
use sluice_core::now_millis;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::service::{activity_service, pipeline_service};
use crate::state::AppState;

pub struct CronScheduler {
    state: AppState,
    interval: Duration,
}

impl CronScheduler {
    pub fn new(state: AppState, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Starts the scheduling loop
    pub async fn run(&self) -> Result<()> {
        info!("Starting cron scheduler (interval: {:?})", self.interval);

        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.trigger_due(now_millis()).await {
                error!("Error during cron cycle: {:#}", e);
            }
        }
    }

    /// Starts every pipeline due at `now` (epoch millis); returns how many started
    pub async fn trigger_due(&self, now: i64) -> Result<usize> {
        let due = pipeline_service::due_pipelines(&self.state, now)
            .await
            .context("Failed to list due pipelines")?;

        if due.is_empty() {
            debug!("No pipelines due");
            return Ok(0);
        }

        let mut started = 0;
        for pipeline in due {
            let req = RunPipeline {
                pipeline_id: pipeline.id.clone(),
                trigger_type: TriggerType::Cron,
            };
            match activity_service::run_pipeline(&self.state, req).await {
                Ok(activity) => {
                    info!(
                        "Scheduled run {} of pipeline {} started",
                        activity.run_sequence, pipeline.name
                    );
                    started += 1;
                }
                Err(e) => {
                    error!("Scheduled run of pipeline {} failed: {}", pipeline.id, e);
                    if let Err(e) = pipeline_service::reschedule(&self.state, &pipeline.id).await {
                        warn!("Failed to reschedule pipeline {}: {}", pipeline.id, e);
                    }
                }
            }
        }

        Ok(started)
    }
}

//! Sync poller
//!
//! Reconciles every unfinished activity with the backend on a fixed interval.
//! Each activity syncs in its own task; a semaphore bounds how many run at
//! once and activities over the bound wait for the next tick.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::service::activity_service;
use crate::state::AppState;

/// Poller that keeps unfinished activities in step with the backend
pub struct SyncPoller {
    state: AppState,
    interval: Duration,
    semaphore: Arc<Semaphore>,
}

impl SyncPoller {
    /// Creates a new sync poller
    pub fn new(state: AppState, interval: Duration, max_parallel_syncs: usize) -> Self {
        Self {
            state,
            interval,
            semaphore: Arc::new(Semaphore::new(max_parallel_syncs.max(1))),
        }
    }

    /// Starts the polling loop
    pub async fn run(&self) -> Result<()> {
        info!("Starting sync poller (interval: {:?})", self.interval);

        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.sync_once().await {
                Ok(changed) => {
                    if changed > 0 {
                        info!("Updated {} activities this cycle", changed);
                    }
                }
                Err(e) => {
                    error!("Error during sync cycle: {:#}", e);
                }
            }
        }
    }

    /// Performs a single sync cycle; returns how many activities changed
    pub async fn sync_once(&self) -> Result<usize> {
        let activities = activity_service::list_unfinished(&self.state)
            .await
            .context("Failed to list unfinished activities")?;

        if activities.is_empty() {
            debug!("No unfinished activities");
            return Ok(0);
        }

        let mut handles = Vec::new();

        for activity in activities {
            // Try to acquire semaphore permit, skip if at max capacity
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                handles.push(self.spawn_sync_task(activity.id, permit));
            } else {
                debug!("Max parallel syncs reached, skipping activity {} for now", activity.id);
            }
        }

        let mut changed = 0;
        for handle in handles {
            match handle.await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!("Sync task panicked: {}", e),
            }
        }

        Ok(changed)
    }

    /// Spawns a task to sync a single activity
    fn spawn_sync_task(
        &self,
        activity_id: String,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> tokio::task::JoinHandle<bool> {
        let state = self.state.clone();

        tokio::spawn(async move {
            // Permit is released when the task ends
            let _permit = permit;
            match activity_service::sync_activity(&state, &activity_id).await {
                Ok(changed) => changed,
                Err(e) => {
                    error!("Failed to sync activity {}: {}", activity_id, e);
                    false
                }
            }
        })
    }
}

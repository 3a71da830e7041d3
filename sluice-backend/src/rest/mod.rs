//! REST backend
//!
//! Drives a Jenkins-style CI server over its REST API. Each step becomes one
//! server-side job named after its [`UnitRef`]; a stage unit is served by
//! combining the last builds of the stage's step jobs.

mod config;
mod descriptor;
mod jobs;
mod nodes;

pub use config::{BackendConfig, Endpoints};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use sluice_core::domain::activity::Activity;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{BackendError, Result};
use crate::unit::{Handle, InfoSnapshot, UnitRef, UnitResult, UnitState};
use crate::ExecutionBackend;

/// Execution backend over a CI server's REST API
#[derive(Debug, Clone)]
pub struct RestBackend {
    config: BackendConfig,
    client: Client,
}

impl RestBackend {
    /// Create a backend; the request timeout from `config` applies to every call
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { config, client })
    }

    /// Create a backend with a custom HTTP client
    pub fn with_client(config: BackendConfig, client: Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.config.url(path));
        if self.config.user.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.config.user, Some(&self.config.token))
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::State(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response whose body is plain text
    async fn handle_text_response(&self, response: reqwest::Response) -> Result<String> {
        let response = Self::check_status(response).await?;
        Ok(response.text().await?)
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check_status(response).await.map(|_| ())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() && !status.is_redirection() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    // =============================================================================
    // Inspection
    // =============================================================================

    async fn inspect_step(&self, name: &str) -> Result<Option<InfoSnapshot>> {
        let Some(job) = self.job_info(name).await? else {
            return Ok(None);
        };

        if job.in_queue {
            let id = job
                .queue_item
                .map(|q| q.id)
                .ok_or_else(|| BackendError::State(format!("queue item of {name} has no id")))?;
            return Ok(Some(InfoSnapshot::queued(id)));
        }

        let Some(build) = self.build_info(name).await? else {
            return Ok(None);
        };

        let handle = Handle::Run {
            unit: name.to_string(),
        };
        let (state, finished_at) = match (build.building, build.result.as_deref()) {
            (false, Some("SUCCESS")) => (
                UnitState::Finished(UnitResult::Success),
                build.timestamp + build.duration,
            ),
            (false, Some(_)) => (
                UnitState::Finished(UnitResult::Failure),
                build.timestamp + build.duration,
            ),
            _ => (UnitState::Running(handle), 0),
        };

        let raw_log = match self.build_log(name, 0).await {
            Ok(log) => log,
            Err(e) => {
                debug!("No output yet for {}: {}", name, e);
                String::new()
            }
        };

        Ok(Some(InfoSnapshot {
            state,
            started_at: build.timestamp,
            finished_at,
            raw_log,
            commit: build.commit(),
        }))
    }

    /// Combines the step jobs of a stage, in step order
    async fn inspect_stage(&self, unit: &UnitRef) -> Result<Option<InfoSnapshot>> {
        let mut steps = Vec::with_capacity(unit.step_count);
        for step in 0..unit.step_count {
            if let Some(snapshot) = self.inspect_step(&unit.step_unit(step).name).await? {
                steps.push(snapshot);
            }
        }
        Ok(InfoSnapshot::combine(steps, unit.not_before))
    }
}

#[async_trait]
impl ExecutionBackend for RestBackend {
    async fn prepare(&self, activity: &Activity, stage: usize, step: usize) -> Result<UnitRef> {
        let unit = UnitRef::step(activity, stage, step);
        let xml = descriptor::job_descriptor(activity, stage, step, &self.config.workspace_root)?;

        if self.job_info(&unit.name).await?.is_some() {
            debug!("Updating job {}", unit.name);
            self.update_job(&unit.name, xml).await?;
        } else {
            debug!("Creating job {}", unit.name);
            self.create_job(&unit.name, xml).await?;
        }
        Ok(unit)
    }

    async fn trigger(&self, unit: &UnitRef, params: &BTreeMap<String, String>) -> Result<Handle> {
        self.build_job(&unit.name, params).await
    }

    async fn inspect(&self, unit: &UnitRef) -> Result<Option<InfoSnapshot>> {
        if unit.is_stage() {
            self.inspect_stage(unit).await
        } else {
            self.inspect_step(&unit.name).await
        }
    }

    async fn cancel(&self, handle: &Handle) -> Result<()> {
        match handle {
            Handle::Queued { id } => self.cancel_queue_item(*id).await,
            Handle::Run { unit } => self.stop_build(unit).await,
        }
    }

    async fn delete_artifact(&self, unit: &UnitRef) -> Result<()> {
        self.delete_build(&unit.name).await
    }

    async fn active_workers(&self) -> Result<Vec<String>> {
        self.active_nodes().await
    }

    async fn fetch_log(&self, unit: &UnitRef, start_line: usize) -> Result<String> {
        self.build_log(&unit.name, start_line).await
    }

    async fn exec_on_worker(&self, node: &str, command: &str) -> Result<String> {
        self.run_script(node, command).await
    }
}

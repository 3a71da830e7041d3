//! Job-related API endpoints

use reqwest::Method;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::RestBackend;
use super::config::expand;
use crate::error::{BackendError, Result};
use crate::unit::Handle;

#[derive(Debug, Deserialize)]
pub(crate) struct JobInfo {
    #[serde(rename = "inQueue", default)]
    pub in_queue: bool,
    #[serde(rename = "queueItem", default)]
    pub queue_item: Option<QueueItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueItem {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BuildInfo {
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<String>,
    /// Epoch millis
    #[serde(default)]
    pub timestamp: i64,
    /// Millis
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub actions: Vec<Option<BuildAction>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BuildAction {
    #[serde(rename = "lastBuiltRevision", default)]
    pub last_built_revision: Option<Revision>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Revision {
    #[serde(rename = "SHA1", default)]
    pub sha1: String,
}

impl BuildInfo {
    /// Revision the build checked out, if it checked one out
    pub fn commit(&self) -> Option<String> {
        self.actions
            .iter()
            .flatten()
            .filter_map(|a| a.last_built_revision.as_ref())
            .map(|r| r.sha1.clone())
            .find(|sha| !sha.is_empty())
    }
}

/// Queue item id from a `Location: .../queue/item/42/` header
pub(crate) fn queue_id_from_location(location: &str) -> Option<u64> {
    location.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

impl RestBackend {
    // =============================================================================
    // Job Definitions
    // =============================================================================

    /// Job metadata, `None` when the job does not exist
    pub(crate) async fn job_info(&self, name: &str) -> Result<Option<JobInfo>> {
        let path = expand(&self.config.endpoints.job_info, name);
        let response = self.request(Method::GET, &path).send().await?;

        match self.handle_response(response).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn create_job(&self, name: &str, xml: String) -> Result<()> {
        let path = expand(&self.config.endpoints.create_job, name);
        let response = self
            .request(Method::POST, &path)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(xml)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    pub(crate) async fn update_job(&self, name: &str, xml: String) -> Result<()> {
        let path = expand(&self.config.endpoints.update_job, name);
        let response = self
            .request(Method::POST, &path)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(xml)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Builds
    // =============================================================================

    /// Queues a build and returns its queue handle
    pub(crate) async fn build_job(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Handle> {
        let request = if params.is_empty() {
            self.request(Method::POST, &expand(&self.config.endpoints.build, name))
        } else {
            self.request(
                Method::POST,
                &expand(&self.config.endpoints.build_with_params, name),
            )
            .form(params)
        };
        let response = request.send().await?;
        let response = Self::check_status(response).await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| BackendError::State(format!("build of {name} returned no queue location")))?;
        let id = queue_id_from_location(location)
            .ok_or_else(|| BackendError::State(format!("cannot read queue id from '{location}'")))?;

        Ok(Handle::Queued { id })
    }

    /// Last build of a job, `None` when it never ran
    pub(crate) async fn build_info(&self, name: &str) -> Result<Option<BuildInfo>> {
        let path = expand(&self.config.endpoints.build_info, name);
        let response = self.request(Method::GET, &path).send().await?;

        match self.handle_response(response).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Timestamped output of the last build from `start_line` on
    pub(crate) async fn build_log(&self, name: &str, start_line: usize) -> Result<String> {
        let mut path = expand(&self.config.endpoints.build_log, name);
        if start_line > 0 {
            path.push_str(&format!("&startLine={start_line}"));
        }
        let response = self.request(Method::GET, &path).send().await?;

        self.handle_text_response(response).await
    }

    pub(crate) async fn stop_build(&self, name: &str) -> Result<()> {
        let path = expand(&self.config.endpoints.stop_build, name);
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_empty_response(response).await
    }

    pub(crate) async fn delete_build(&self, name: &str) -> Result<()> {
        let path = expand(&self.config.endpoints.delete_build, name);
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_empty_response(response).await
    }

    pub(crate) async fn cancel_queue_item(&self, id: u64) -> Result<()> {
        let path = self
            .config
            .endpoints
            .cancel_queue_item
            .replace("{id}", &id.to_string());
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_empty_response(response).await
    }
}

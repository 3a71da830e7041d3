//! Post-run cleanup
//!
//! Hooks that run once an activity reaches a terminal status. Each hook gets
//! the backend and the finished activity; failures are reported to the caller
//! and never change the activity.

use async_trait::async_trait;
use sluice_backend::{BackendError, ExecutionBackend};
use sluice_core::domain::activity::Activity;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("cleanup '{hook}' failed for activity {activity_id}: {source}")]
pub struct CleanupError {
    pub hook: &'static str,
    pub activity_id: String,
    #[source]
    pub source: BackendError,
}

#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        activity: &Activity,
    ) -> Result<(), CleanupError>;
}

/// Removes side-car containers started for the activity
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceContainerCleanup;

impl ServiceContainerCleanup {
    pub fn command(activity_id: &str) -> String {
        format!("docker ps --filter label=activityid={activity_id} -q | xargs -r docker rm -f")
    }
}

#[async_trait]
impl CleanupHook for ServiceContainerCleanup {
    fn name(&self) -> &'static str {
        "service-containers"
    }

    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        activity: &Activity,
    ) -> Result<(), CleanupError> {
        backend
            .exec_on_worker(&activity.node_name, &Self::command(&activity.id))
            .await
            .map(|_| ())
            .map_err(|source| CleanupError {
                hook: self.name(),
                activity_id: activity.id.clone(),
                source,
            })
    }
}

/// Deletes the activity's workspace unless the pipeline keeps it
#[derive(Debug, Clone)]
pub struct WorkspaceCleanup {
    workspace_root: String,
}

impl WorkspaceCleanup {
    pub fn new(workspace_root: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn command(&self, activity_id: &str) -> String {
        format!(
            "rm -rf \"{}/{}\"",
            self.workspace_root.trim_end_matches('/'),
            activity_id
        )
    }
}

#[async_trait]
impl CleanupHook for WorkspaceCleanup {
    fn name(&self) -> &'static str {
        "workspace"
    }

    async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        activity: &Activity,
    ) -> Result<(), CleanupError> {
        if activity.pipeline.keep_workspace {
            return Ok(());
        }
        backend
            .exec_on_worker(&activity.node_name, &self.command(&activity.id))
            .await
            .map(|_| ())
            .map_err(|source| CleanupError {
                hook: self.name(),
                activity_id: activity.id.clone(),
                source,
            })
    }
}

/// The hooks a production orchestrator runs
pub fn default_hooks(workspace_root: &str) -> Vec<Arc<dyn CleanupHook>> {
    vec![
        Arc::new(ServiceContainerCleanup),
        Arc::new(WorkspaceCleanup::new(workspace_root)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_backend::FakeBackend;
    use sluice_core::domain::pipeline::{Pipeline, Stage, Step, TriggerType};

    fn activity(keep_workspace: bool) -> Activity {
        let mut p = Pipeline::new("p1", "demo")
            .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "true")));
        p.keep_workspace = keep_workspace;
        let mut a = Activity::from_pipeline(&p, "w1", TriggerType::Manual, 0);
        a.id = "act1".into();
        a
    }

    #[tokio::test]
    async fn test_default_hooks_run_on_activity_worker() {
        let fake = FakeBackend::new();
        for hook in default_hooks("/var/ws/") {
            hook.run(&fake, &activity(false)).await.unwrap();
        }

        assert_eq!(
            fake.commands(),
            vec![
                ServiceContainerCleanup::command("act1"),
                "rm -rf \"/var/ws/act1\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_workspace_kept_when_requested() {
        let fake = FakeBackend::new();
        WorkspaceCleanup::new("/ws")
            .run(&fake, &activity(true))
            .await
            .unwrap();
        assert!(fake.commands().is_empty());
    }
}

//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::activity::Status;

/// Pipeline definition
///
/// Immutable during a run except for the run counters, which only the driver
/// touches after an activity has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub stages: Vec<Stage>,
    /// User parameters as `KEY=VALUE` strings
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub cron_trigger: CronTrigger,
    #[serde(default)]
    pub is_activate: bool,
    #[serde(default)]
    pub keep_workspace: bool,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub last_run_status: Option<Status>,
    /// Epoch millis, 0 if never run
    #[serde(default)]
    pub last_run_time: i64,
    /// Epoch millis, 0 if not scheduled
    #[serde(default)]
    pub next_run_time: i64,
}

impl Pipeline {
    /// Creates an empty pipeline with the given id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stages: Vec::new(),
            parameters: Vec::new(),
            cron_trigger: CronTrigger::default(),
            is_activate: false,
            keep_workspace: false,
            run_count: 0,
            last_run_id: None,
            last_run_status: None,
            last_run_time: 0,
            next_run_time: 0,
        }
    }

    /// Adds a stage
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Parsed user parameters; entries without `=` are ignored
    pub fn parameter_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().filter_map(|p| p.split_once('='))
    }

    /// The first step of the first stage when it is a source checkout
    pub fn checkout_step(&self) -> Option<&ScmStep> {
        match self.stages.first()?.steps.first()?.kind {
            StepKind::Scm(ref scm) => Some(scm),
            _ => None,
        }
    }
}

/// Time-based trigger configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTrigger {
    /// Cron expression (5-field or `@daily` style descriptor)
    #[serde(default)]
    pub spec: String,
    /// IANA timezone name; empty means UTC
    #[serde(default)]
    pub timezone: String,
}

/// A named group of steps, run in order or in parallel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub need_approve: bool,
    #[serde(default)]
    pub conditions: Option<Conditions>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            parallel: false,
            need_approve: false,
            conditions: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn need_approve(mut self) -> Self {
        self.need_approve = true;
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// True when the stage carries at least one predicate
    pub fn has_conditions(&self) -> bool {
        self.conditions.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// The smallest unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Timeout in minutes, 0 for none
    #[serde(default)]
    pub timeout: u32,
    #[serde(default)]
    pub conditions: Option<Conditions>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout: 0,
            conditions: None,
        }
    }

    /// Shorthand for a task step running `script` in `image`
    pub fn task(name: impl Into<String>, image: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::Task(TaskStep {
                image: image.into(),
                shell_script: script.into(),
                ..TaskStep::default()
            }),
        )
    }

    /// Shorthand for a source checkout step
    pub fn scm(name: impl Into<String>, repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::Scm(ScmStep {
                repository: repository.into(),
                branch: branch.into(),
                git_user: String::new(),
            }),
        )
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// True when the step carries at least one predicate
    pub fn has_conditions(&self) -> bool {
        self.conditions.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn step_type(&self) -> StepType {
        match self.kind {
            StepKind::Task(_) => StepType::Task,
            StepKind::Build(_) => StepType::Build,
            StepKind::Scm(_) => StepType::Scm,
            StepKind::UpgradeService(_) => StepType::UpgradeService,
            StepKind::UpgradeStack(_) => StepType::UpgradeStack,
            StepKind::UpgradeCatalog(_) => StepType::UpgradeCatalog,
        }
    }
}

/// Step type discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Build,
    Scm,
    UpgradeService,
    UpgradeStack,
    UpgradeCatalog,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Task => "task",
            StepType::Build => "build",
            StepType::Scm => "scm",
            StepType::UpgradeService => "upgrade_service",
            StepType::UpgradeStack => "upgrade_stack",
            StepType::UpgradeCatalog => "upgrade_catalog",
        };
        f.write_str(name)
    }
}

/// Type-specific step parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Task(TaskStep),
    Build(BuildStep),
    Scm(ScmStep),
    UpgradeService(UpgradeServiceStep),
    UpgradeStack(UpgradeStackStep),
    UpgradeCatalog(UpgradeCatalogStep),
}

/// Run a command or script in a container image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStep {
    pub image: String,
    pub entrypoint: String,
    pub args: String,
    pub shell_script: String,
    /// Extra environment as `KEY=VALUE`
    pub env: Vec<String>,
    /// Keep the container running as a side-car for later steps
    pub is_service: bool,
    pub alias: String,
    /// Aliases of side-car services this task links to
    pub services: Vec<String>,
}

/// Build (and optionally push) an image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildStep {
    pub target_image: String,
    /// Inline Dockerfile content; takes precedence over `dockerfile_path`
    pub dockerfile: String,
    pub dockerfile_path: String,
    pub build_path: String,
    pub push: bool,
}

/// Check out source code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScmStep {
    pub repository: String,
    pub branch: String,
    pub git_user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeServiceStep {
    pub image_tag: String,
    pub service_selector: BTreeMap<String, String>,
    pub batch_size: u32,
    pub interval: u32,
    pub start_first: bool,
    pub endpoint: String,
    pub access_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeStackStep {
    pub stack_name: String,
    pub docker_compose: String,
    pub rancher_compose: String,
    pub endpoint: String,
    pub access_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeCatalogStep {
    /// `catalog:template[:version]`
    pub external_id: String,
    pub repository: String,
    pub branch: String,
    pub templates: BTreeMap<String, String>,
    pub answers: String,
    pub deploy: bool,
    pub stack_name: String,
    pub endpoint: String,
    pub access_key: String,
}

/// Gating predicates for a stage or step
///
/// Each element is `key=value` or `key!=value`. When both lists are present
/// only `all` is evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
}

impl Conditions {
    pub fn all<I, S>(predicates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all: predicates.into_iter().map(Into::into).collect(),
            any: Vec::new(),
        }
    }

    pub fn any<I, S>(predicates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all: Vec::new(),
            any: predicates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty()
    }
}

/// How an activity was started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Cron,
    Webhook,
    Rerun,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Manual => write!(f, "manual"),
            TriggerType::Cron => write!(f, "cron"),
            TriggerType::Webhook => write!(f, "webhook"),
            TriggerType::Rerun => write!(f, "rerun"),
        }
    }
}

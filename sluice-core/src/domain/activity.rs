//! Activity domain types
//!
//! An activity is one run of a pipeline. It embeds a snapshot of the pipeline
//! definition and mirrors every stage and step with a runtime node carrying
//! status and timing. Runtime nodes carry their ordinal so a node can always
//! be matched back to its definition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::pipeline::{Pipeline, Stage, Step, TriggerType};

/// Lifecycle status shared by activities, stages and steps
///
/// Moves forward only within one run:
/// `Waiting -> (Skip | Pending | Building) -> (Success | Fail | Abort)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Waiting,
    Pending,
    Building,
    Skip,
    Success,
    Fail,
    Abort,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Skip | Status::Success | Status::Fail | Status::Abort
        )
    }

    /// Success or Skip: the unit no longer blocks what follows it
    pub fn is_done(self) -> bool {
        matches!(self, Status::Success | Status::Skip)
    }

    fn rank(self) -> u8 {
        match self {
            Status::Waiting => 0,
            Status::Pending => 1,
            Status::Building => 2,
            Status::Skip | Status::Success | Status::Fail | Status::Abort => 3,
        }
    }

    /// Whether moving from `self` to `next` respects forward-only ordering
    pub fn can_advance_to(self, next: Status) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Waiting => write!(f, "Waiting"),
            Status::Pending => write!(f, "Pending"),
            Status::Building => write!(f, "Building"),
            Status::Skip => write!(f, "Skip"),
            Status::Success => write!(f, "Success"),
            Status::Fail => write!(f, "Fail"),
            Status::Abort => write!(f, "Abort"),
        }
    }
}

/// One run of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    /// Definition snapshot taken at trigger time
    pub pipeline: Pipeline,
    pub run_sequence: u32,
    pub status: Status,
    /// Epoch millis
    pub start_ts: i64,
    /// Epoch millis, 0 while running
    pub stop_ts: i64,
    /// Worker the run is pinned to
    pub node_name: String,
    /// Resolved commit SHA, set at most once per run
    pub commit_info: Option<String>,
    pub trigger_type: TriggerType,
    pub env_vars: BTreeMap<String, String>,
    /// Stage awaiting manual approval
    pub pending_stage: Option<usize>,
    pub stages: Vec<ActivityStage>,
}

/// Runtime mirror of a [`Stage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStage {
    pub ordinal: usize,
    pub name: String,
    pub status: Status,
    pub start_ts: i64,
    pub duration: i64,
    pub need_approval: bool,
    pub steps: Vec<ActivityStep>,
}

/// Runtime mirror of a [`Step`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStep {
    pub ordinal: usize,
    pub name: String,
    pub status: Status,
    pub start_ts: i64,
    pub duration: i64,
}

/// Violation of the activity/definition pairing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("activity has {actual} stages, definition has {expected}")]
    StageCount { expected: usize, actual: usize },
    #[error("stage {stage} has {actual} steps, definition has {expected}")]
    StepCount {
        stage: usize,
        expected: usize,
        actual: usize,
    },
    #[error("node at position {position} carries ordinal {ordinal}")]
    Ordinal { position: String, ordinal: usize },
}

impl ActivityStage {
    fn from_stage(ordinal: usize, stage: &Stage) -> Self {
        Self {
            ordinal,
            name: stage.name.clone(),
            status: Status::Waiting,
            start_ts: 0,
            duration: 0,
            need_approval: stage.need_approve,
            steps: stage
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| ActivityStep::from_step(i, step))
                .collect(),
        }
    }

    /// All steps finished successfully or were skipped
    pub fn all_steps_done(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_done())
    }

    /// Moves the stage status forward; returns false when the move would regress
    pub fn advance(&mut self, next: Status) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

impl ActivityStep {
    fn from_step(ordinal: usize, step: &Step) -> Self {
        Self {
            ordinal,
            name: step.name.clone(),
            status: Status::Waiting,
            start_ts: 0,
            duration: 0,
        }
    }

    /// Moves the step status forward; returns false when the move would regress
    pub fn advance(&mut self, next: Status) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

impl Activity {
    /// Builds a fresh activity for `pipeline`, with every stage and step Waiting
    pub fn from_pipeline(
        pipeline: &Pipeline,
        node_name: impl Into<String>,
        trigger_type: TriggerType,
        now: i64,
    ) -> Self {
        let mut activity = Self {
            id: Uuid::new_v4().simple().to_string(),
            pipeline: pipeline.clone(),
            run_sequence: pipeline.run_count + 1,
            status: Status::Waiting,
            start_ts: now,
            stop_ts: 0,
            node_name: node_name.into(),
            commit_info: None,
            trigger_type,
            env_vars: BTreeMap::new(),
            pending_stage: None,
            stages: pipeline
                .stages
                .iter()
                .enumerate()
                .map(|(i, stage)| ActivityStage::from_stage(i, stage))
                .collect(),
        };
        activity.init_env_vars();
        activity
    }

    /// Materializes run-scoped variables from run metadata and pipeline parameters
    ///
    /// Parameters are applied last and may shadow the built-in names.
    pub fn init_env_vars(&mut self) {
        let p = &self.pipeline;
        let (git_url, git_branch) = p
            .checkout_step()
            .map(|scm| (scm.repository.clone(), scm.branch.clone()))
            .unwrap_or_default();

        let mut vars = BTreeMap::new();
        vars.insert("CICD_PIPELINE_NAME".to_string(), p.name.clone());
        vars.insert("CICD_PIPELINE_ID".to_string(), p.id.clone());
        vars.insert("CICD_NODE_NAME".to_string(), self.node_name.clone());
        vars.insert("CICD_ACTIVITY_ID".to_string(), self.id.clone());
        vars.insert(
            "CICD_ACTIVITY_SEQUENCE".to_string(),
            self.run_sequence.to_string(),
        );
        vars.insert("CICD_GIT_URL".to_string(), git_url);
        vars.insert("CICD_GIT_BRANCH".to_string(), git_branch);
        vars.insert(
            "CICD_GIT_COMMIT".to_string(),
            self.commit_info.clone().unwrap_or_default(),
        );
        vars.insert(
            "CICD_TRIGGER_TYPE".to_string(),
            self.trigger_type.to_string(),
        );
        for (key, value) in p.parameter_pairs() {
            vars.insert(key.to_string(), value.to_string());
        }
        self.env_vars = vars;
    }

    /// Records the resolved commit; the first non-empty value wins
    pub fn set_commit(&mut self, sha: &str) -> bool {
        if sha.is_empty() || self.commit_info.as_deref().is_some_and(|c| !c.is_empty()) {
            return false;
        }
        self.commit_info = Some(sha.to_string());
        let slot = self.env_vars.entry("CICD_GIT_COMMIT".to_string()).or_default();
        if slot.is_empty() {
            *slot = sha.to_string();
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_last_stage(&self, ordinal: usize) -> bool {
        ordinal + 1 == self.stages.len()
    }

    pub fn stage_def(&self, ordinal: usize) -> Option<&Stage> {
        self.pipeline.stages.get(ordinal)
    }

    pub fn step_def(&self, stage: usize, step: usize) -> Option<&Step> {
        self.stage_def(stage)?.steps.get(step)
    }

    /// Moves the activity status forward; returns false when the move would regress
    pub fn advance(&mut self, next: Status) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Records the terminal transition; returns true only for the first one
    pub fn finish(&mut self, status: Status, stop_ts: i64) -> bool {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.stop_ts = stop_ts;
        self.pending_stage = None;
        true
    }

    /// Every status field in the tree, in a fixed order
    ///
    /// Two fingerprints differ iff some status differs.
    pub fn status_fingerprint(&self) -> Vec<Status> {
        let mut out = Vec::with_capacity(1 + self.stages.len());
        out.push(self.status);
        for stage in &self.stages {
            out.push(stage.status);
            out.extend(stage.steps.iter().map(|s| s.status));
        }
        out
    }

    /// Puts the tree back to Waiting for a new run sequence on the same identity
    ///
    /// The resolved commit is kept so re-provisioned units build the same revision.
    pub fn reset_for_rerun(&mut self, node_name: impl Into<String>, now: i64) {
        self.node_name = node_name.into();
        self.run_sequence = self.pipeline.run_count + 1;
        self.status = Status::Waiting;
        self.start_ts = now.max(self.start_ts);
        self.stop_ts = 0;
        self.pending_stage = None;
        self.trigger_type = TriggerType::Rerun;
        for stage in &mut self.stages {
            stage.status = Status::Waiting;
            stage.start_ts = 0;
            stage.duration = 0;
            for step in &mut stage.steps {
                step.status = Status::Waiting;
                step.start_ts = 0;
                step.duration = 0;
            }
        }
        self.init_env_vars();
    }

    /// Checks that the runtime tree still pairs 1:1 with the definition snapshot
    pub fn check_shape(&self) -> Result<(), ShapeError> {
        let defs = &self.pipeline.stages;
        if defs.len() != self.stages.len() {
            return Err(ShapeError::StageCount {
                expected: defs.len(),
                actual: self.stages.len(),
            });
        }
        for (i, (def, stage)) in defs.iter().zip(&self.stages).enumerate() {
            if stage.ordinal != i {
                return Err(ShapeError::Ordinal {
                    position: i.to_string(),
                    ordinal: stage.ordinal,
                });
            }
            if def.steps.len() != stage.steps.len() {
                return Err(ShapeError::StepCount {
                    stage: i,
                    expected: def.steps.len(),
                    actual: stage.steps.len(),
                });
            }
            for (j, step) in stage.steps.iter().enumerate() {
                if step.ordinal != j {
                    return Err(ShapeError::Ordinal {
                        position: format!("{i}.{j}"),
                        ordinal: step.ordinal,
                    });
                }
            }
        }
        Ok(())
    }
}

//! Units of work and what the backend reports about them

use sluice_core::domain::activity::Activity;

use crate::segment::{rebase_elapsed, strip_preamble};

/// Backend-side address of the unit of work for a step, or of a whole stage
///
/// A stage unit is a view over the step units of that stage: inspecting it
/// yields their combined output in step order (see [`InfoSnapshot::combine`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitRef {
    pub activity_id: String,
    pub stage: usize,
    /// `None` for a stage unit
    pub step: Option<usize>,
    /// Number of steps in the stage
    pub step_count: usize,
    /// Backend job name
    pub name: String,
    /// Start of the activity run, epoch millis; step runs that started
    /// earlier belong to a previous run
    pub not_before: i64,
}

impl UnitRef {
    /// Unit for a whole stage
    pub fn stage(activity: &Activity, stage: usize) -> Self {
        let step_count = activity.stages.get(stage).map_or(0, |s| s.steps.len());
        Self {
            activity_id: activity.id.clone(),
            stage,
            step: None,
            step_count,
            name: stage_prefix(activity, stage),
            not_before: activity.start_ts,
        }
    }

    /// Unit for one step
    pub fn step(activity: &Activity, stage: usize, step: usize) -> Self {
        Self::stage(activity, stage).step_unit(step)
    }

    /// Unit of step `step` within this unit's stage
    pub fn step_unit(&self, step: usize) -> Self {
        let prefix = match self.step {
            Some(_) => self.name.rsplit_once('_').map_or(self.name.as_str(), |(p, _)| p),
            None => self.name.as_str(),
        };
        Self {
            activity_id: self.activity_id.clone(),
            stage: self.stage,
            step: Some(step),
            step_count: self.step_count,
            name: format!("{prefix}_{step}"),
            not_before: self.not_before,
        }
    }

    pub fn is_stage(&self) -> bool {
        self.step.is_none()
    }
}

fn stage_prefix(activity: &Activity, stage: usize) -> String {
    let stage_name = activity
        .stages
        .get(stage)
        .map_or_else(|| stage.to_string(), |s| s.name.clone());
    [
        sanitize(&activity.pipeline.name),
        sanitize(&activity.id),
        sanitize(&stage_name),
    ]
    .join("_")
}

/// Job names end up in URL paths
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Backend-native handle of a started unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Handle {
    /// Waiting in the backend queue
    Queued { id: u64 },
    /// Executing; addressed by job name
    Run { unit: String },
}

/// Result code of a finished unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitResult {
    Success,
    Failure,
}

/// Where a unit is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Queued(Handle),
    Running(Handle),
    Finished(UnitResult),
}

impl UnitState {
    /// Handle to cancel while the unit is still in flight
    pub fn handle(&self) -> Option<&Handle> {
        match self {
            UnitState::Queued(h) | UnitState::Running(h) => Some(h),
            UnitState::Finished(_) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, UnitState::Running(_))
    }
}

/// What the backend knows about a unit right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoSnapshot {
    pub state: UnitState,
    /// Epoch millis, 0 while queued
    pub started_at: i64,
    /// Epoch millis, 0 until finished
    pub finished_at: i64,
    /// Timestamped console output
    pub raw_log: String,
    /// Commit SHA the unit checked out, when it did
    pub commit: Option<String>,
}

impl InfoSnapshot {
    pub fn queued(id: u64) -> Self {
        Self {
            state: UnitState::Queued(Handle::Queued { id }),
            started_at: 0,
            finished_at: 0,
            raw_log: String::new(),
            commit: None,
        }
    }

    pub fn running(unit: impl Into<String>, started_at: i64, raw_log: impl Into<String>) -> Self {
        Self {
            state: UnitState::Running(Handle::Run { unit: unit.into() }),
            started_at,
            finished_at: 0,
            raw_log: raw_log.into(),
            commit: None,
        }
    }

    pub fn finished(
        result: UnitResult,
        started_at: i64,
        finished_at: i64,
        raw_log: impl Into<String>,
    ) -> Self {
        Self {
            state: UnitState::Finished(result),
            started_at,
            finished_at,
            raw_log: raw_log.into(),
            commit: None,
        }
    }

    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        self.commit = Some(sha.into());
        self
    }

    /// Result code when the unit has finished
    pub fn result(&self) -> Option<UnitResult> {
        match self.state {
            UnitState::Finished(r) => Some(r),
            _ => None,
        }
    }

    /// Stage view over the snapshots of its step units, given in step order
    ///
    /// Snapshots that started before `not_before` are left out. Each later
    /// step contributes its output from the first shell invocation on, with
    /// its elapsed stamps moved onto the clock of the first step.
    pub fn combine<I>(steps: I, not_before: i64) -> Option<InfoSnapshot>
    where
        I: IntoIterator<Item = InfoSnapshot>,
    {
        let mut combined: Option<InfoSnapshot> = None;

        for snapshot in steps {
            if snapshot.started_at > 0 && snapshot.started_at < not_before {
                continue;
            }
            combined = Some(match combined {
                None => snapshot,
                Some(mut acc) => {
                    if acc.started_at == 0 {
                        acc.started_at = snapshot.started_at;
                    }
                    let shift = if snapshot.started_at > 0 {
                        snapshot.started_at - acc.started_at
                    } else {
                        0
                    };
                    let output = rebase_elapsed(strip_preamble(&snapshot.raw_log), shift);
                    if !output.is_empty() && !acc.raw_log.is_empty() && !acc.raw_log.ends_with('\n')
                    {
                        acc.raw_log.push('\n');
                    }
                    acc.raw_log.push_str(&output);
                    acc.finished_at = acc.finished_at.max(snapshot.finished_at);
                    acc.commit = acc.commit.or(snapshot.commit);
                    acc.state = merge_state(acc.state, snapshot.state);
                    acc
                }
            });
        }

        combined
    }
}

/// In-flight beats failed beats succeeded
fn merge_state(a: UnitState, b: UnitState) -> UnitState {
    match (&a, &b) {
        (UnitState::Queued(_) | UnitState::Running(_), _) => a,
        (_, UnitState::Queued(_) | UnitState::Running(_)) => b,
        (UnitState::Finished(UnitResult::Failure), _) => a,
        _ => b,
    }
}

//! Activity reconciler
//!
//! Pulls what the backend reports about an activity's units back into the
//! activity tree. Sequential stages are read through their stage unit: the
//! combined output is cut into per-step segments and the segments are laid
//! over the steps that were not skipped, in order. Parallel stages are read
//! step by step.
//!
//! Statuses only ever move forward, so running the reconciler again on an
//! unchanged backend changes nothing.

use sluice_backend::segment::{LogSegmenter, Segment, ShellInvocationSegmenter};
use sluice_backend::{InfoSnapshot, UnitRef, UnitResult, UnitState};
use sluice_core::domain::activity::{Activity, Status};
use sluice_core::domain::pipeline::StepType;
use sluice_core::now_millis;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::Result;
use super::driver::Driver;

/// Brings activities up to date with their backend units
pub struct Reconciler {
    driver: Arc<Driver>,
    segmenter: Arc<dyn LogSegmenter>,
}

impl Reconciler {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            segmenter: Arc::new(ShellInvocationSegmenter),
        }
    }

    /// Use a different output format for sequential stage units
    pub fn with_segmenter(mut self, segmenter: Arc<dyn LogSegmenter>) -> Self {
        self.segmenter = segmenter;
        self
    }

    pub fn segmenter(&self) -> &dyn LogSegmenter {
        self.segmenter.as_ref()
    }

    /// Updates `activity` from the backend; returns whether any status changed
    ///
    /// Only the first stage that is not done is looked at. Backend errors
    /// leave the activity as it was, except a failed continuation, which fails
    /// the activity.
    pub async fn sync(&self, activity: &mut Activity) -> Result<bool> {
        if activity.is_terminal() {
            return Ok(false);
        }
        activity.check_shape()?;

        let before = activity.status_fingerprint();
        let active = activity.stages.iter().position(|s| !s.status.is_done());

        if let Some(stage) = active {
            let parallel = activity.stage_def(stage).is_some_and(|s| s.parallel);
            if parallel {
                self.sync_parallel_stage(activity, stage).await;
            } else {
                self.sync_sequential_stage(activity, stage).await;
            }
        }

        let changed = before != activity.status_fingerprint();
        if changed {
            debug!("Activity {} is now {}", activity.id, activity.status);
        }
        Ok(changed)
    }

    // =============================================================================
    // Sequential Stages
    // =============================================================================

    async fn sync_sequential_stage(&self, activity: &mut Activity, stage: usize) {
        let unit = UnitRef::stage(activity, stage);
        let snapshot = match self.driver.backend().inspect(&unit).await {
            Ok(Some(s)) if !not_started(&s) => s,
            Ok(_) => {
                activity.stages[stage].advance(Status::Waiting);
                return;
            }
            Err(e) => {
                warn!("Cannot inspect {}: {}", unit.name, e);
                return;
            }
        };

        activity.advance(Status::Building);
        if let Some(sha) = &snapshot.commit {
            activity.set_commit(sha);
        }
        let node = &mut activity.stages[stage];
        node.advance(Status::Building);
        if snapshot.started_at > 0 {
            node.start_ts = snapshot.started_at;
        }

        self.lay_out_steps(activity, stage, &snapshot);

        let stop_ts = stop_time(&snapshot);
        let node = &mut activity.stages[stage];
        if node.steps.iter().any(|s| s.status == Status::Fail) {
            node.advance(Status::Fail);
            node.duration = stop_ts - node.start_ts;
            self.driver
                .finish_activity(activity, Status::Fail, stop_ts)
                .await;
            return;
        }

        if node.all_steps_done() {
            node.advance(Status::Success);
            node.duration = stop_ts - node.start_ts;
            if let Err(e) = self.driver.complete_stage(activity, stage).await {
                self.fail_continuation(activity, e.to_string()).await;
            }
            return;
        }

        // Everything triggered so far has finished; start the next step.
        let in_flight = node.steps.iter().any(|s| s.status == Status::Building);
        if snapshot.result() == Some(UnitResult::Success) && !in_flight {
            let waiting = node.steps.iter().position(|s| s.status == Status::Waiting);
            if let Some(step) = waiting {
                if let Err(e) = self.driver.run_step(activity, stage, step).await {
                    self.fail_continuation(activity, e.to_string()).await;
                }
            }
        }
    }

    /// Maps output segments onto the stage's non-skipped steps, in order
    fn lay_out_steps(&self, activity: &mut Activity, stage: usize, snapshot: &InfoSnapshot) {
        let raw = snapshot.raw_log.as_str();
        let segmentation = self.segmenter.segment(raw);
        let leading_checkout = segmentation.checkout
            && activity
                .step_def(stage, 0)
                .is_some_and(|s| s.step_type() == StepType::Scm);

        let mut units: Vec<&Segment> = Vec::with_capacity(segmentation.invocations.len() + 1);
        if leading_checkout {
            units.push(&segmentation.preamble);
        }
        units.extend(segmentation.invocations.iter());

        let outcome = snapshot.result().or_else(|| self.segmenter.outcome(raw));
        let node = &mut activity.stages[stage];
        let stage_start = node.start_ts;
        let targets: Vec<usize> = node
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status != Status::Skip)
            .map(|(j, _)| j)
            .collect();

        for (k, (&step, segment)) in targets.iter().zip(&units).enumerate() {
            let status = if k + 1 < units.len() {
                Status::Success
            } else {
                match outcome {
                    Some(UnitResult::Success) => Status::Success,
                    Some(UnitResult::Failure) => Status::Fail,
                    None => Status::Building,
                }
            };

            let step = &mut node.steps[step];
            if !step.advance(status) {
                continue;
            }
            if let Some(offset) = segment.start_ms {
                step.start_ts = stage_start + offset;
            }
            if status.is_terminal() {
                step.duration = segment.duration_ms().unwrap_or(0);
            }
        }
    }

    // =============================================================================
    // Parallel Stages
    // =============================================================================

    async fn sync_parallel_stage(&self, activity: &mut Activity, stage: usize) {
        let mut started = false;

        for step in 0..activity.stages[stage].steps.len() {
            let current = activity.stages[stage].steps[step].status;
            if current.is_terminal() {
                continue;
            }
            if current == Status::Building {
                started = true;
            }

            let unit = UnitRef::step(activity, stage, step);
            let snapshot = match self.driver.backend().inspect(&unit).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cannot inspect {}: {}", unit.name, e);
                    continue;
                }
            };
            if let Some(sha) = &snapshot.commit {
                activity.set_commit(sha);
            }

            let node = &mut activity.stages[stage].steps[step];
            match snapshot.state {
                UnitState::Queued(_) => {}
                UnitState::Running(_) => {
                    started = true;
                    node.advance(Status::Building);
                    if snapshot.started_at > 0 {
                        node.start_ts = snapshot.started_at;
                    }
                }
                UnitState::Finished(result) => {
                    started = true;
                    let status = match result {
                        UnitResult::Success => Status::Success,
                        UnitResult::Failure => Status::Fail,
                    };
                    if node.advance(status) {
                        node.start_ts = snapshot.started_at;
                        node.duration = snapshot.finished_at - snapshot.started_at;
                    }
                }
            }
        }

        let node = &mut activity.stages[stage];
        if !started && node.steps.iter().all(|s| s.status == Status::Waiting) {
            node.advance(Status::Waiting);
            return;
        }
        activity.advance(Status::Building);
        let node = &mut activity.stages[stage];
        node.advance(Status::Building);

        if !node.steps.iter().all(|s| s.status.is_terminal()) {
            return;
        }

        let stop_ts = node
            .steps
            .iter()
            .map(|s| s.start_ts + s.duration)
            .max()
            .unwrap_or_else(now_millis);
        let failed = node.steps.iter().any(|s| s.status == Status::Fail);
        node.advance(if failed { Status::Fail } else { Status::Success });
        node.duration = stop_ts - node.start_ts;

        if failed {
            self.driver
                .finish_activity(activity, Status::Fail, stop_ts)
                .await;
        } else if let Err(e) = self.driver.complete_stage(activity, stage).await {
            self.fail_continuation(activity, e.to_string()).await;
        }
    }

    /// A unit that should have started could not be; the run cannot go on
    async fn fail_continuation(&self, activity: &mut Activity, reason: String) {
        error!("Cannot continue activity {}: {}", activity.id, reason);
        let now = now_millis();
        if let Some(node) = activity.stages.iter_mut().find(|s| !s.status.is_terminal()) {
            node.advance(Status::Fail);
            if node.start_ts > 0 {
                node.duration = now - node.start_ts;
            }
        }
        self.driver.finish_activity(activity, Status::Fail, now).await;
    }
}

/// Nothing ran yet: no answer, or a queued unit with no output
fn not_started(snapshot: &InfoSnapshot) -> bool {
    matches!(snapshot.state, UnitState::Queued(_)) && snapshot.raw_log.is_empty()
}

fn stop_time(snapshot: &InfoSnapshot) -> i64 {
    if snapshot.finished_at > 0 {
        snapshot.finished_at
    } else {
        now_millis()
    }
}

//! Activity driver
//!
//! Pushes an activity forward on orchestrator-side events: a run is
//! requested, a stage is approved, a run is stopped or rerun. Entering a stage
//! or a step either triggers backend units or, when its conditions do not
//! hold, skips it and moves on. Skips cascade through a small work loop so a
//! chain of skipped stages never recurses.

use rand::seq::IteratorRandom;
use sluice_backend::{ExecutionBackend, UnitRef, UnitState};
use sluice_core::condition;
use sluice_core::domain::activity::{Activity, Status};
use sluice_core::domain::pipeline::{Conditions, Pipeline, TriggerType};
use sluice_core::now_millis;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cleanup::CleanupHook;
use super::{EngineError, Result};

/// Next piece of work for the drive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Done,
    Stage(usize),
    Step(usize, usize),
}

/// Drives activities through their stages on a backend
pub struct Driver {
    backend: Arc<dyn ExecutionBackend>,
    hooks: Vec<Arc<dyn CleanupHook>>,
}

impl Driver {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            hooks: Vec::new(),
        }
    }

    /// Hooks run once when an activity reaches a terminal status
    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn CleanupHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn backend(&self) -> &dyn ExecutionBackend {
        self.backend.as_ref()
    }

    // =============================================================================
    // Runs
    // =============================================================================

    /// Creates and starts a new activity of `pipeline` on a random active worker
    pub async fn run_pipeline(&self, pipeline: &Pipeline, trigger: TriggerType) -> Result<Activity> {
        if pipeline.stages.is_empty() {
            return Err(EngineError::Definition(format!(
                "pipeline {} has no stages",
                pipeline.id
            )));
        }

        let node = self.pick_worker().await?;
        let mut activity = Activity::from_pipeline(pipeline, node, trigger, now_millis());
        info!(
            "Starting activity {} (run {}) of pipeline {} on {}",
            activity.id, activity.run_sequence, pipeline.name, activity.node_name
        );

        self.prepare_all(&activity).await?;
        self.start(&mut activity).await?;
        Ok(activity)
    }

    /// Re-runs a finished activity under the same id
    ///
    /// The caller refreshes `activity.pipeline.run_count` first so the new run
    /// gets the next sequence number.
    pub async fn rerun_activity(&self, activity: &mut Activity) -> Result<()> {
        if !activity.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "activity {} is still {}",
                activity.id, activity.status
            )));
        }
        activity.check_shape()?;
        if activity.stages.is_empty() {
            return Err(EngineError::Definition(format!(
                "activity {} has no stages",
                activity.id
            )));
        }

        if self
            .backend
            .inspect(&UnitRef::step(activity, 0, 0))
            .await?
            .is_some()
        {
            self.delete_previous_runs(activity).await;
        }

        let node = self.pick_worker().await?;
        activity.reset_for_rerun(node, now_millis());
        info!(
            "Rerunning activity {} as run {} on {}",
            activity.id, activity.run_sequence, activity.node_name
        );

        self.prepare_all(activity).await?;
        self.start(activity).await
    }

    /// Releases the stage parked for approval
    pub async fn approve_activity(&self, activity: &mut Activity) -> Result<()> {
        let stage = match (activity.status, activity.pending_stage) {
            (Status::Pending, Some(stage)) => stage,
            _ => {
                return Err(EngineError::InvalidState(format!(
                    "activity {} is not awaiting approval",
                    activity.id
                )));
            }
        };

        info!("Stage {} of activity {} approved", stage, activity.id);
        activity.pending_stage = None;
        self.run_stage(activity, stage).await
    }

    /// Enters stage `stage` and follows any skips it causes
    pub async fn run_stage(&self, activity: &mut Activity, stage: usize) -> Result<()> {
        let next = self.enter_stage(activity, stage).await?;
        self.drive(activity, next).await
    }

    /// Enters step `step` of stage `stage` and follows any skips it causes
    pub async fn run_step(&self, activity: &mut Activity, stage: usize, step: usize) -> Result<()> {
        let next = self.enter_step(activity, stage, step).await?;
        self.drive(activity, next).await
    }

    /// Continues after every unit of stage `stage` succeeded
    ///
    /// The stage must already be marked Success.
    pub async fn complete_stage(&self, activity: &mut Activity, stage: usize) -> Result<()> {
        let next = self.stage_succeeded(activity, stage).await?;
        self.drive(activity, next).await
    }

    // =============================================================================
    // Stopping
    // =============================================================================

    /// Aborts the activity, cancelling whatever its active stage has in flight
    ///
    /// Steps that cannot be stopped are logged and left as they are.
    pub async fn stop_activity(&self, activity: &mut Activity) -> Result<()> {
        if activity.is_terminal() {
            return Ok(());
        }
        let now = now_millis();

        if let Some(stage) = activity.stages.iter().position(|s| !s.status.is_done()) {
            for step in 0..activity.stages[stage].steps.len() {
                if let Err(e) = self.stop_step(activity, stage, step).await {
                    warn!(
                        "Failed to stop step {}.{} of activity {}: {}",
                        stage, step, activity.id, e
                    );
                }
            }
            let stage = &mut activity.stages[stage];
            if stage.advance(Status::Abort) && stage.start_ts > 0 {
                stage.duration = now - stage.start_ts;
            }
        }

        info!("Stopping activity {}", activity.id);
        self.finish_activity(activity, Status::Abort, now).await;
        Ok(())
    }

    /// Cancels one step's unit if it is still in flight
    ///
    /// Only a running step moves to Abort. A queued step is taken out of the
    /// queue but keeps its status, so it can stay Building inside an aborted
    /// activity.
    pub async fn stop_step(&self, activity: &mut Activity, stage: usize, step: usize) -> Result<()> {
        let status = activity
            .stages
            .get(stage)
            .and_then(|s| s.steps.get(step))
            .map(|s| s.status)
            .ok_or(EngineError::OutOfRange {
                stage,
                step: Some(step),
            })?;
        if status.is_terminal() {
            return Ok(());
        }

        let unit = UnitRef::step(activity, stage, step);
        let Some(snapshot) = self.backend.inspect(&unit).await? else {
            return Ok(());
        };

        match &snapshot.state {
            UnitState::Queued(handle) => {
                debug!("Removing {} from the queue", unit.name);
                self.backend.cancel(handle).await?;
            }
            UnitState::Running(handle) => {
                debug!("Stopping {}", unit.name);
                self.backend.cancel(handle).await?;
                let step = &mut activity.stages[stage].steps[step];
                if step.advance(Status::Abort) && step.start_ts > 0 {
                    step.duration = now_millis() - step.start_ts;
                }
            }
            UnitState::Finished(_) => {}
        }
        Ok(())
    }

    // =============================================================================
    // Completion
    // =============================================================================

    /// Records the terminal status and runs cleanup the first time only
    pub async fn finish_activity(&self, activity: &mut Activity, status: Status, stop_ts: i64) {
        if activity.finish(status, stop_ts) {
            info!("Activity {} finished: {}", activity.id, status);
            self.on_activity_complete(activity).await;
        }
    }

    /// Runs every cleanup hook; failures are logged only
    pub async fn on_activity_complete(&self, activity: &Activity) {
        for hook in &self.hooks {
            match hook.run(self.backend.as_ref(), activity).await {
                Ok(()) => debug!("Cleanup {} done for {}", hook.name(), activity.id),
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// Random choice among the backend's active workers
    pub async fn pick_worker(&self) -> Result<String> {
        let workers = self.backend.active_workers().await?;
        choose_worker(workers).ok_or(EngineError::NoWorkerAvailable)
    }

    // =============================================================================
    // Internals
    // =============================================================================

    async fn drive(&self, activity: &mut Activity, mut next: Advance) -> Result<()> {
        loop {
            next = match next {
                Advance::Done => return Ok(()),
                Advance::Stage(stage) => self.enter_stage(activity, stage).await?,
                Advance::Step(stage, step) => self.enter_step(activity, stage, step).await?,
            };
        }
    }

    async fn start(&self, activity: &mut Activity) -> Result<()> {
        if activity.stages[0].need_approval {
            hold_for_approval(activity, 0);
            return Ok(());
        }
        self.run_stage(activity, 0).await
    }

    async fn enter_stage(&self, activity: &mut Activity, stage: usize) -> Result<Advance> {
        let (parallel, step_count, run) = match (activity.stage_def(stage), activity.stages.get(stage)) {
            (Some(def), Some(_)) => (
                def.parallel,
                def.steps.len(),
                conditions_hold(&activity.env_vars, def.conditions.as_ref())?,
            ),
            _ => return Err(EngineError::OutOfRange { stage, step: None }),
        };

        if !run {
            info!("Skipping stage {} of activity {}", stage, activity.id);
            let node = &mut activity.stages[stage];
            node.advance(Status::Skip);
            for step in &mut node.steps {
                step.advance(Status::Skip);
            }
            return self.stage_succeeded(activity, stage).await;
        }

        activity.advance(Status::Building);
        let node = &mut activity.stages[stage];
        node.advance(Status::Building);
        node.start_ts = now_millis();

        if step_count == 0 {
            node.advance(Status::Success);
            return self.stage_succeeded(activity, stage).await;
        }
        if !parallel {
            return Ok(Advance::Step(stage, 0));
        }

        let mut next = Advance::Done;
        for step in 0..step_count {
            let after = self.enter_step(activity, stage, step).await?;
            if next == Advance::Done {
                next = after;
            }
        }
        Ok(next)
    }

    async fn enter_step(&self, activity: &mut Activity, stage: usize, step: usize) -> Result<Advance> {
        let (parallel, run) = match (
            activity.stage_def(stage),
            activity.step_def(stage, step),
            activity.stages.get(stage).and_then(|s| s.steps.get(step)),
        ) {
            (Some(stage_def), Some(def), Some(_)) => (
                stage_def.parallel,
                conditions_hold(&activity.env_vars, def.conditions.as_ref())?,
            ),
            _ => {
                return Err(EngineError::OutOfRange {
                    stage,
                    step: Some(step),
                });
            }
        };

        if !run {
            info!(
                "Skipping step {}.{} of activity {}",
                stage, step, activity.id
            );
            let node = &mut activity.stages[stage];
            node.steps[step].advance(Status::Skip);

            if node.all_steps_done() {
                node.advance(Status::Success);
                node.duration = now_millis() - node.start_ts;
                return self.stage_succeeded(activity, stage).await;
            }
            if !parallel && step + 1 < node.steps.len() {
                return Ok(Advance::Step(stage, step + 1));
            }
            return Ok(Advance::Done);
        }

        let unit = UnitRef::step(activity, stage, step);
        let handle = self.backend.trigger(&unit, &activity.env_vars).await?;
        debug!("Triggered {} ({:?})", unit.name, handle);

        let node = &mut activity.stages[stage].steps[step];
        node.advance(Status::Building);
        node.start_ts = now_millis();
        Ok(Advance::Done)
    }

    async fn stage_succeeded(&self, activity: &mut Activity, stage: usize) -> Result<Advance> {
        if activity.is_last_stage(stage) {
            self.finish_activity(activity, Status::Success, now_millis())
                .await;
            return Ok(Advance::Done);
        }

        let next = stage + 1;
        if activity.stages[next].need_approval {
            hold_for_approval(activity, next);
            return Ok(Advance::Done);
        }
        Ok(Advance::Stage(next))
    }

    async fn prepare_all(&self, activity: &Activity) -> Result<()> {
        for (stage, node) in activity.stages.iter().enumerate() {
            for step in 0..node.steps.len() {
                self.backend.prepare(activity, stage, step).await?;
            }
        }
        Ok(())
    }

    /// Deletes every step build the backend still keeps for this activity
    ///
    /// Aborted and half-started steps leave builds behind too; a stale build
    /// would otherwise be read as part of the new run.
    async fn delete_previous_runs(&self, activity: &Activity) {
        for (stage, node) in activity.stages.iter().enumerate() {
            for step in 0..node.steps.len() {
                let unit = UnitRef::step(activity, stage, step);
                let built = match self.backend.inspect(&unit).await {
                    Ok(Some(s)) => !matches!(s.state, UnitState::Queued(_)),
                    Ok(None) => false,
                    Err(e) => {
                        warn!("Cannot inspect {}: {}", unit.name, e);
                        false
                    }
                };
                if !built {
                    continue;
                }
                if let Err(e) = self.backend.delete_artifact(&unit).await {
                    warn!("Failed to delete previous run of {}: {}", unit.name, e);
                }
            }
        }
    }
}

/// Parks the activity until stage `stage` is approved
fn hold_for_approval(activity: &mut Activity, stage: usize) {
    info!(
        "Activity {} waiting for approval of stage {}",
        activity.id, stage
    );
    // The only backward move: a building run parks as Pending.
    activity.status = Status::Pending;
    activity.stages[stage].advance(Status::Pending);
    activity.pending_stage = Some(stage);
}

fn conditions_hold(vars: &BTreeMap<String, String>, conditions: Option<&Conditions>) -> Result<bool> {
    match conditions {
        Some(c) if !c.is_empty() => Ok(condition::evaluate(vars, c)?),
        _ => Ok(true),
    }
}

fn choose_worker(workers: Vec<String>) -> Option<String> {
    workers.into_iter().choose(&mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sluice_backend::{BackendCall, FakeBackend, Handle, InfoSnapshot};
    use sluice_core::domain::pipeline::{Stage, Step};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::engine::cleanup::CleanupError;

    struct CountingHook(Arc<AtomicUsize>);

    #[async_trait]
    impl CleanupHook for CountingHook {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(
            &self,
            _backend: &dyn ExecutionBackend,
            _activity: &Activity,
        ) -> std::result::Result<(), CleanupError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn driver(fake: &FakeBackend) -> (Driver, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let driver = Driver::new(Arc::new(fake.clone()))
            .with_hooks(vec![Arc::new(CountingHook(Arc::clone(&count)))]);
        (driver, count)
    }

    fn never() -> Conditions {
        Conditions::all(["CICD_TRIGGER_TYPE=never"])
    }

    #[tokio::test]
    async fn test_run_pipeline_triggers_first_step_only() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(
                Stage::new("build")
                    .with_step(Step::task("a", "alpine", "true"))
                    .with_step(Step::task("b", "alpine", "true")),
            )
            .with_stage(Stage::new("ship").with_step(Step::task("c", "alpine", "true")));

        let a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();

        assert_eq!(a.node_name, "w1");
        assert_eq!(a.status, Status::Building);
        assert_eq!(fake.prepared().len(), 3);
        assert_eq!(fake.triggered(), vec![UnitRef::step(&a, 0, 0).name]);
        assert_eq!(a.stages[0].status, Status::Building);
        assert_eq!(a.stages[0].steps[0].status, Status::Building);
        assert_eq!(a.stages[0].steps[1].status, Status::Waiting);
        assert_eq!(a.stages[1].status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_parallel_stage_triggers_every_step() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo").with_stage(
            Stage::new("test")
                .parallel()
                .with_step(Step::task("a", "alpine", "true"))
                .with_step(Step::task("b", "alpine", "true").with_conditions(never()))
                .with_step(Step::task("c", "alpine", "true")),
        );

        let a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();

        assert_eq!(fake.triggered().len(), 2);
        assert_eq!(a.stages[0].steps[1].status, Status::Skip);
        assert_eq!(a.stages[0].steps[2].status, Status::Building);
    }

    #[tokio::test]
    async fn test_no_worker_available() {
        let fake = FakeBackend::new();
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "true")));

        let err = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap_err();
        assert!(matches!(err, EngineError::NoWorkerAvailable));
        assert!(fake.prepared().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pipeline_rejected() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let err = driver
            .run_pipeline(&Pipeline::new("p1", "demo"), TriggerType::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
    }

    #[tokio::test]
    async fn test_skipping_everything_succeeds_and_cleans_up_once() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, cleanups) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(
                Stage::new("lint")
                    .with_step(Step::task("a", "alpine", "true"))
                    .with_conditions(never()),
            )
            .with_stage(
                Stage::new("ship").with_step(Step::task("b", "alpine", "true").with_conditions(never())),
            );

        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();

        assert!(fake.triggered().is_empty());
        assert_eq!(a.stages[0].status, Status::Skip);
        assert_eq!(a.stages[1].status, Status::Success);
        assert_eq!(a.stages[1].steps[0].status, Status::Skip);
        assert_eq!(a.status, Status::Success);
        assert!(a.stop_ts > 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        driver.stop_activity(&mut a).await.unwrap();
        assert_eq!(a.status, Status::Success);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_approval_gate_on_first_stage() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo").with_stage(
            Stage::new("deploy")
                .need_approve()
                .with_step(Step::task("a", "alpine", "true")),
        );

        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();
        assert_eq!(a.status, Status::Pending);
        assert_eq!(a.pending_stage, Some(0));
        assert_eq!(a.stages[0].status, Status::Pending);
        assert!(fake.triggered().is_empty());

        driver.approve_activity(&mut a).await.unwrap();
        assert_eq!(a.status, Status::Building);
        assert_eq!(a.pending_stage, None);
        assert_eq!(fake.triggered().len(), 1);

        let err = driver.approve_activity(&mut a).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_completed_stage_parks_before_approval_stage() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "true")))
            .with_stage(
                Stage::new("deploy")
                    .need_approve()
                    .with_step(Step::task("b", "alpine", "true")),
            );

        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();
        a.stages[0].steps[0].status = Status::Success;
        a.stages[0].status = Status::Success;
        driver.complete_stage(&mut a, 0).await.unwrap();

        assert_eq!(a.status, Status::Pending);
        assert_eq!(a.pending_stage, Some(1));
        assert_eq!(fake.triggered().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_steps() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, cleanups) = driver(&fake);
        let p = Pipeline::new("p1", "demo").with_stage(
            Stage::new("test")
                .parallel()
                .with_step(Step::task("a", "alpine", "true"))
                .with_step(Step::task("b", "alpine", "true")),
        );
        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();
        let first = UnitRef::step(&a, 0, 0);
        let second = UnitRef::step(&a, 0, 1);
        fake.set_snapshot(&first, InfoSnapshot::running(&first.name, 10, ""));
        fake.set_snapshot(&second, InfoSnapshot::queued(4));

        driver.stop_activity(&mut a).await.unwrap();

        assert_eq!(
            fake.cancelled(),
            vec![
                Handle::Run {
                    unit: first.name.clone()
                },
                Handle::Queued { id: 4 },
            ]
        );
        assert_eq!(a.stages[0].steps[0].status, Status::Abort);
        assert_eq!(a.stages[0].steps[1].status, Status::Building);
        assert_eq!(a.stages[0].status, Status::Abort);
        assert_eq!(a.status, Status::Abort);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_continues_past_failed_cancel() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo").with_stage(
            Stage::new("test")
                .parallel()
                .with_step(Step::task("a", "alpine", "true"))
                .with_step(Step::task("b", "alpine", "true")),
        );
        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();
        let first = UnitRef::step(&a, 0, 0);
        let second = UnitRef::step(&a, 0, 1);
        fake.set_snapshot(&first, InfoSnapshot::running(&first.name, 10, ""));
        fake.set_snapshot(&second, InfoSnapshot::running(&second.name, 10, ""));
        fake.fail_cancel(&first);

        driver.stop_activity(&mut a).await.unwrap();

        assert_eq!(fake.cancelled().len(), 2);
        assert_eq!(a.stages[0].steps[0].status, Status::Building);
        assert_eq!(a.stages[0].steps[1].status, Status::Abort);
        assert_eq!(a.status, Status::Abort);
    }

    #[tokio::test]
    async fn test_stop_step_out_of_range() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "true")));
        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();

        let err = driver.stop_step(&mut a, 0, 3).await.unwrap_err();
        assert!(matches!(err, EngineError::OutOfRange { stage: 0, step: Some(3) }));
    }

    #[tokio::test]
    async fn test_rerun_resets_and_deletes_previous_runs() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "true")))
            .with_stage(Stage::new("ship").with_step(Step::task("b", "alpine", "true")));
        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();

        let err = driver.rerun_activity(&mut a).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let first = UnitRef::step(&a, 0, 0);
        fake.set_snapshot(&first, InfoSnapshot::finished(sluice_backend::UnitResult::Failure, 1, 2, ""));
        a.stages[0].steps[0].status = Status::Fail;
        a.stages[0].status = Status::Fail;
        driver.finish_activity(&mut a, Status::Fail, 5).await;
        let started = a.start_ts;
        a.pipeline.run_count = 3;

        driver.rerun_activity(&mut a).await.unwrap();

        assert!(fake.calls().contains(&BackendCall::DeleteArtifact {
            unit: first.name.clone()
        }));
        assert_eq!(a.run_sequence, 4);
        assert!(a.start_ts >= started);
        assert_eq!(a.status, Status::Building);
        assert_eq!(a.stages[0].steps[0].status, Status::Building);
        assert_eq!(a.stages[1].status, Status::Waiting);
        assert_eq!(fake.prepared().len(), 4);
    }

    #[tokio::test]
    async fn test_rerun_after_abort_deletes_aborted_builds() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, _) = driver(&fake);
        let p = Pipeline::new("p1", "demo").with_stage(
            Stage::new("build")
                .with_step(Step::task("a", "alpine", "true"))
                .with_step(Step::task("b", "alpine", "true")),
        );
        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();
        let t0 = a.start_ts;
        let first = UnitRef::step(&a, 0, 0);
        let second = UnitRef::step(&a, 0, 1);
        fake.set_snapshot(
            &first,
            InfoSnapshot::finished(sluice_backend::UnitResult::Success, t0 + 10, t0 + 20, ""),
        );
        fake.set_snapshot(&second, InfoSnapshot::running(&second.name, t0 + 30, ""));
        a.stages[0].steps[0].status = Status::Success;
        a.stages[0].steps[1].status = Status::Building;

        driver.stop_activity(&mut a).await.unwrap();
        assert_eq!(a.stages[0].steps[1].status, Status::Abort);
        fake.set_snapshot(
            &second,
            InfoSnapshot::finished(
                sluice_backend::UnitResult::Failure,
                t0 + 30,
                t0 + 40,
                "00h00m00s010ms  Finished: ABORTED\n",
            ),
        );

        driver.rerun_activity(&mut a).await.unwrap();

        let calls = fake.calls();
        for unit in [&first, &second] {
            assert!(calls.contains(&BackendCall::DeleteArtifact {
                unit: unit.name.clone()
            }));
        }
        assert_eq!(fake.inspect(&second).await.unwrap(), None);
        assert_eq!(a.stages[0].steps[0].status, Status::Building);
        assert_eq!(a.stages[0].steps[1].status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_stop_aborts_only_the_active_stage() {
        let fake = FakeBackend::with_workers(["w1"]);
        let (driver, cleanups) = driver(&fake);
        let p = Pipeline::new("p1", "demo")
            .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "true")))
            .with_stage(
                Stage::new("test")
                    .parallel()
                    .with_step(Step::task("b", "alpine", "true"))
                    .with_step(Step::task("c", "alpine", "true")),
            )
            .with_stage(Stage::new("ship").with_step(Step::task("d", "alpine", "true")));
        let mut a = driver.run_pipeline(&p, TriggerType::Manual).await.unwrap();
        a.stages[0].steps[0].status = Status::Success;
        a.stages[0].status = Status::Success;
        a.stages[0].duration = 1_500;
        driver.complete_stage(&mut a, 0).await.unwrap();
        assert_eq!(a.stages[1].steps[0].status, Status::Building);
        assert_eq!(a.stages[1].steps[1].status, Status::Building);

        for step in 0..2 {
            let unit = UnitRef::step(&a, 1, step);
            fake.set_snapshot(&unit, InfoSnapshot::running(&unit.name, a.start_ts + 10, ""));
        }
        let finished_stage = a.stages[0].clone();

        driver.stop_activity(&mut a).await.unwrap();

        assert_eq!(fake.cancelled().len(), 2);
        assert_eq!(a.stages[0], finished_stage);
        assert_eq!(a.stages[1].status, Status::Abort);
        assert_eq!(a.stages[1].steps[0].status, Status::Abort);
        assert_eq!(a.stages[1].steps[1].status, Status::Abort);
        assert_eq!(a.stages[2].status, Status::Waiting);
        assert_eq!(a.stages[2].steps[0].status, Status::Waiting);
        assert_eq!(a.status, Status::Abort);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conditions_hold_without_predicates() {
        let vars = BTreeMap::new();
        assert!(conditions_hold(&vars, None).unwrap());
        assert!(conditions_hold(&vars, Some(&Conditions::default())).unwrap());
        assert!(conditions_hold(&vars, Some(&Conditions::all(["bogus"]))).is_err());
    }
}

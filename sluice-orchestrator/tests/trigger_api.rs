//! End-to-end runs through the service layer, backed by an in-memory store
//! and a scripted backend.

use std::sync::Arc;
use std::time::Duration;

use sluice_backend::{BackendCall, FakeBackend, Handle, InfoSnapshot, UnitRef, UnitResult};
use sluice_core::domain::activity::Status;
use sluice_core::domain::pipeline::{CronTrigger, Pipeline, Stage, Step, TriggerType};
use sluice_core::dto::activity::{RunPipeline, StepLogRequest};
use sluice_core::dto::event::{ChangeAction, ResourceChange, ResourceKind};
use sluice_orchestrator::AppState;
use sluice_orchestrator::engine::{Driver, EngineError, cleanup};
use sluice_orchestrator::events::EventBus;
use sluice_orchestrator::repository::activity_repository;
use sluice_orchestrator::scheduler::{CronScheduler, SyncPoller};
use sluice_orchestrator::service::activity::ActivityError;
use sluice_orchestrator::service::pipeline::PipelineError;
use sluice_orchestrator::service::{activity_service, pipeline_service};
use sluice_orchestrator::store::MemoryStore;

const A_SUCCESS: &str = "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/a.sh\n\
00h00m00s120ms  + make\n\
00h00m01s100ms  ok\n\
00h00m01s150ms  Finished: SUCCESS\n";

const B_SUCCESS: &str = "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/b.sh\n\
00h00m00s150ms  + make test\n\
00h00m01s150ms  passed\n\
00h00m01s200ms  Finished: SUCCESS\n";

const ONE_STEP_SUCCESS: &str = "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/d.sh\n\
00h00m00s150ms  + ./deploy\n\
00h00m00s900ms  Finished: SUCCESS\n";

const ONE_STEP_FAILURE: &str = "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/a.sh\n\
00h00m00s150ms  + make\n\
00h00m00s900ms  Finished: FAILURE\n";

fn setup() -> (FakeBackend, AppState) {
    let fake = FakeBackend::with_workers(["w1"]);
    let driver = Driver::new(Arc::new(fake.clone())).with_hooks(cleanup::default_hooks("/ws"));
    let state = AppState::new(Arc::new(MemoryStore::new()), driver, EventBus::new(64));
    (fake, state)
}

fn build_and_ship() -> Pipeline {
    Pipeline::new("p1", "demo")
        .with_stage(
            Stage::new("build")
                .with_step(Step::task("a", "alpine", "make"))
                .with_step(Step::task("b", "alpine", "make test")),
        )
        .with_stage(Stage::new("ship").with_step(Step::task("d", "alpine", "./deploy")))
}

fn single_step() -> Pipeline {
    Pipeline::new("p1", "demo")
        .with_stage(Stage::new("build").with_step(Step::task("a", "alpine", "make")))
}

fn manual(pipeline_id: &str) -> RunPipeline {
    RunPipeline {
        pipeline_id: pipeline_id.to_string(),
        trigger_type: TriggerType::Manual,
    }
}

#[tokio::test]
async fn test_run_pipeline_persists_activity_and_bookkeeping() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, build_and_ship()).await.unwrap();
    let mut rx = state.events.subscribe();

    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    assert_eq!(activity.run_sequence, 1);
    assert_eq!(activity.status, Status::Building);
    assert_eq!(activity.node_name, "w1");
    assert_eq!(fake.triggered(), vec![UnitRef::step(&activity, 0, 0).name]);
    assert_eq!(fake.prepared().len(), 3);

    let stored = activity_service::get_activity(&state, &activity.id).await.unwrap();
    assert_eq!(stored, activity);

    let pipeline = pipeline_service::get_pipeline(&state, "p1").await.unwrap();
    assert_eq!(pipeline.run_count, 1);
    assert_eq!(pipeline.last_run_id.as_deref(), Some(activity.id.as_str()));
    assert_eq!(pipeline.last_run_status, Some(Status::Building));
    assert_eq!(pipeline.last_run_time, activity.start_ts);

    assert_eq!(
        rx.recv().await.unwrap(),
        ResourceChange::new(ResourceKind::Activity, &activity.id, ChangeAction::Create)
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        ResourceChange::new(ResourceKind::Pipeline, "p1", ChangeAction::Update)
    );

    let second = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();
    assert_eq!(second.run_sequence, 2);
    assert_ne!(second.id, activity.id);
}

#[tokio::test]
async fn test_run_unknown_pipeline() {
    let (_fake, state) = setup();
    let err = activity_service::run_pipeline(&state, manual("missing")).await.unwrap_err();
    assert!(matches!(err, ActivityError::PipelineNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn test_run_without_workers_leaves_no_activity() {
    let (fake, state) = setup();
    fake.set_workers(Vec::<String>::new());
    pipeline_service::create_pipeline(&state, single_step()).await.unwrap();

    let err = activity_service::run_pipeline(&state, manual("p1")).await.unwrap_err();
    assert!(matches!(err, ActivityError::Engine(EngineError::NoWorkerAvailable)));
    assert!(activity_service::list_activities(&state).await.unwrap().is_empty());
    assert_eq!(pipeline_service::get_pipeline(&state, "p1").await.unwrap().run_count, 0);
}

#[tokio::test]
async fn test_sync_drives_run_to_success() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, build_and_ship()).await.unwrap();
    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    // Nothing reported yet
    assert!(!activity_service::sync_activity(&state, &activity.id).await.unwrap());

    let t0 = activity.start_ts;
    fake.set_snapshot(
        &UnitRef::step(&activity, 0, 0),
        InfoSnapshot::finished(UnitResult::Success, t0 + 1_000, t0 + 2_150, A_SUCCESS)
            .with_commit("abc123"),
    );
    assert!(activity_service::sync_activity(&state, &activity.id).await.unwrap());
    assert!(fake.triggered().contains(&UnitRef::step(&activity, 0, 1).name));

    fake.set_snapshot(
        &UnitRef::step(&activity, 0, 1),
        InfoSnapshot::finished(UnitResult::Success, t0 + 2_500, t0 + 3_700, B_SUCCESS),
    );
    assert!(activity_service::sync_activity(&state, &activity.id).await.unwrap());

    let stored = activity_service::get_activity(&state, &activity.id).await.unwrap();
    assert_eq!(stored.stages[0].status, Status::Success);
    assert_eq!(stored.stages[1].status, Status::Building);
    assert_eq!(stored.commit_info.as_deref(), Some("abc123"));
    assert!(fake.triggered().contains(&UnitRef::step(&activity, 1, 0).name));

    // Same report again changes nothing
    assert!(!activity_service::sync_activity(&state, &activity.id).await.unwrap());

    fake.set_snapshot(
        &UnitRef::step(&activity, 1, 0),
        InfoSnapshot::finished(UnitResult::Success, t0 + 4_000, t0 + 4_900, ONE_STEP_SUCCESS),
    );
    assert!(activity_service::sync_activity(&state, &activity.id).await.unwrap());

    let stored = activity_service::get_activity(&state, &activity.id).await.unwrap();
    assert_eq!(stored.status, Status::Success);
    assert!(stored.stop_ts > 0);
    assert_eq!(fake.commands().len(), 2);

    let pipeline = pipeline_service::get_pipeline(&state, "p1").await.unwrap();
    assert_eq!(pipeline.last_run_status, Some(Status::Success));

    // Terminal runs are no longer polled
    assert!(activity_service::list_unfinished(&state).await.unwrap().is_empty());
    assert!(!activity_service::sync_activity(&state, &activity.id).await.unwrap());
}

#[tokio::test]
async fn test_stop_aborts_running_step() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, build_and_ship()).await.unwrap();
    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    let step = UnitRef::step(&activity, 0, 0);
    fake.set_snapshot(&step, InfoSnapshot::running(step.name.clone(), 1_000, ""));

    let stopped = activity_service::stop_activity(&state, &activity.id).await.unwrap();
    assert_eq!(stopped.status, Status::Abort);
    assert_eq!(stopped.stages[0].status, Status::Abort);
    assert_eq!(stopped.stages[0].steps[0].status, Status::Abort);
    assert_eq!(stopped.stages[1].status, Status::Waiting);
    assert_eq!(fake.cancelled(), vec![Handle::Run { unit: step.name.clone() }]);

    let pipeline = pipeline_service::get_pipeline(&state, "p1").await.unwrap();
    assert_eq!(pipeline.last_run_status, Some(Status::Abort));

    // A second stop is a no-op
    let again = activity_service::stop_activity(&state, &activity.id).await.unwrap();
    assert_eq!(again, stopped);
    assert_eq!(fake.cancelled().len(), 1);
    assert_eq!(fake.commands().len(), 2);
}

#[tokio::test]
async fn test_concurrent_stops_clean_up_once() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, single_step()).await.unwrap();
    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    let (a, b) = tokio::join!(
        activity_service::stop_activity(&state, &activity.id),
        activity_service::stop_activity(&state, &activity.id),
    );
    assert_eq!(a.unwrap().status, Status::Abort);
    assert_eq!(b.unwrap().status, Status::Abort);
    assert_eq!(fake.commands().len(), 2);
}

#[tokio::test]
async fn test_approval_gate_holds_until_approved() {
    let (fake, state) = setup();
    let mut pipeline = build_and_ship();
    pipeline.stages[1].need_approve = true;
    pipeline_service::create_pipeline(&state, pipeline).await.unwrap();
    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    let t0 = activity.start_ts;
    fake.set_snapshot(
        &UnitRef::step(&activity, 0, 0),
        InfoSnapshot::finished(UnitResult::Success, t0 + 1_000, t0 + 2_150, A_SUCCESS),
    );
    fake.set_snapshot(
        &UnitRef::step(&activity, 0, 1),
        InfoSnapshot::finished(UnitResult::Success, t0 + 2_500, t0 + 3_700, B_SUCCESS),
    );
    assert!(activity_service::sync_activity(&state, &activity.id).await.unwrap());

    let held = activity_service::get_activity(&state, &activity.id).await.unwrap();
    assert_eq!(held.status, Status::Pending);
    assert_eq!(held.pending_stage, Some(1));
    assert_eq!(held.stages[1].status, Status::Pending);
    assert!(!fake.triggered().contains(&UnitRef::step(&activity, 1, 0).name));
    assert_eq!(
        pipeline_service::get_pipeline(&state, "p1").await.unwrap().last_run_status,
        Some(Status::Pending)
    );

    let approved = activity_service::approve_activity(&state, &activity.id).await.unwrap();
    assert_eq!(approved.status, Status::Building);
    assert_eq!(approved.pending_stage, None);
    assert_eq!(approved.stages[1].status, Status::Building);
    assert!(fake.triggered().contains(&UnitRef::step(&activity, 1, 0).name));

    let err = activity_service::approve_activity(&state, &activity.id).await.unwrap_err();
    assert!(matches!(err, ActivityError::Engine(EngineError::InvalidState(_))));
}

#[tokio::test]
async fn test_rerun_failed_activity() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, single_step()).await.unwrap();
    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    let err = activity_service::rerun_activity(&state, &activity.id).await.unwrap_err();
    assert!(matches!(err, ActivityError::Engine(EngineError::InvalidState(_))));

    let t0 = activity.start_ts;
    fake.set_snapshot(
        &UnitRef::step(&activity, 0, 0),
        InfoSnapshot::finished(UnitResult::Failure, t0 + 1_000, t0 + 1_900, ONE_STEP_FAILURE),
    );
    assert!(activity_service::sync_activity(&state, &activity.id).await.unwrap());
    let failed = activity_service::get_activity(&state, &activity.id).await.unwrap();
    assert_eq!(failed.status, Status::Fail);
    assert_eq!(failed.stages[0].steps[0].status, Status::Fail);

    let rerun = activity_service::rerun_activity(&state, &activity.id).await.unwrap();
    assert_eq!(rerun.id, activity.id);
    assert_eq!(rerun.run_sequence, 2);
    assert_eq!(rerun.trigger_type, TriggerType::Rerun);
    assert_eq!(rerun.status, Status::Building);
    assert_eq!(rerun.stop_ts, 0);
    assert_eq!(fake.triggered().len(), 2);

    let pipeline = pipeline_service::get_pipeline(&state, "p1").await.unwrap();
    assert_eq!(pipeline.run_count, 2);
    assert_eq!(pipeline.last_run_status, Some(Status::Building));
}

#[tokio::test]
async fn test_rerun_after_abort_ignores_the_aborted_run() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, build_and_ship()).await.unwrap();
    let mut activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();
    // The first run started a minute ago
    activity.start_ts -= 60_000;
    activity_repository::update(state.store(), &activity).await.unwrap();
    let t0 = activity.start_ts;
    let first = UnitRef::step(&activity, 0, 0);
    let second = UnitRef::step(&activity, 0, 1);

    fake.set_snapshot(
        &first,
        InfoSnapshot::finished(UnitResult::Success, t0 + 1_000, t0 + 2_150, A_SUCCESS),
    );
    assert!(activity_service::sync_activity(&state, &activity.id).await.unwrap());
    fake.set_snapshot(&second, InfoSnapshot::running(second.name.clone(), t0 + 2_500, ""));
    let stopped = activity_service::stop_activity(&state, &activity.id).await.unwrap();
    assert_eq!(stopped.stages[0].steps[1].status, Status::Abort);

    // What the backend reports once the cancelled build is gone
    let aborted = InfoSnapshot::finished(
        UnitResult::Failure,
        t0 + 2_500,
        t0 + 2_900,
        "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/b.sh\n\
00h00m00s400ms  Finished: ABORTED\n",
    );
    fake.set_snapshot(&second, aborted.clone());

    let rerun = activity_service::rerun_activity(&state, &activity.id).await.unwrap();
    let calls = fake.calls();
    assert!(calls.contains(&BackendCall::DeleteArtifact { unit: first.name.clone() }));
    assert!(calls.contains(&BackendCall::DeleteArtifact { unit: second.name.clone() }));

    // Even a build that survived the delete belongs to the old run.
    fake.set_snapshot(&second, aborted);
    let running = "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/a.sh\n\
00h00m00s120ms  + make\n";
    fake.set_snapshot(
        &first,
        InfoSnapshot::running(first.name.clone(), rerun.start_ts + 1_000, running),
    );
    activity_service::sync_activity(&state, &activity.id).await.unwrap();

    let stored = activity_service::get_activity(&state, &activity.id).await.unwrap();
    let steps: Vec<_> = stored.stages[0].steps.iter().map(|s| s.status).collect();
    assert_eq!(steps, vec![Status::Building, Status::Waiting]);
    assert_eq!(stored.stages[0].status, Status::Building);
    assert_eq!(stored.status, Status::Building);
}

#[tokio::test]
async fn test_step_log_continues_from_cursor() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, single_step()).await.unwrap();
    let activity = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();
    let unit = UnitRef::step(&activity, 0, 0);

    let request = |cursor: String| StepLogRequest {
        activity_id: activity.id.clone(),
        stage: 0,
        step: 0,
        cursor,
    };

    // No output yet
    let log = activity_service::get_step_log(&state, request(String::new())).await.unwrap();
    assert_eq!(log.text, "");
    assert_eq!(log.cursor, "");

    let head = "00h00m00s010ms  Started by user admin\n\
00h00m00s100ms  [ws] $ /bin/sh -xe /tmp/a.sh\n\
00h00m00s120ms  + make\n";
    fake.set_log(&unit, head);
    // The echoed command is not part of the step output
    let log = activity_service::get_step_log(&state, request(String::new())).await.unwrap();
    assert_eq!(log.text, "");
    assert_eq!(log.cursor, head);

    let full = format!("{head}00h00m01s100ms  ok\n");
    fake.set_log(&unit, full.clone());
    let log = activity_service::get_step_log(&state, request(log.cursor)).await.unwrap();
    assert_eq!(log.text, "00h00m01s100ms  ok\n");
    assert_eq!(log.cursor, full);
    assert!(fake.calls().contains(&BackendCall::FetchLog {
        unit: unit.name.clone(),
        start_line: 3,
    }));

    let err = activity_service::get_step_log(
        &state,
        StepLogRequest {
            activity_id: activity.id.clone(),
            stage: 0,
            step: 5,
            cursor: String::new(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ActivityError::Engine(EngineError::OutOfRange { .. })));
}

#[tokio::test]
async fn test_pipeline_crud_keeps_run_history() {
    let (_fake, state) = setup();
    let mut pipeline = single_step();
    pipeline.id = String::new();

    let created = pipeline_service::create_pipeline(&state, pipeline).await.unwrap();
    assert!(!created.id.is_empty());
    assert_eq!(created.next_run_time, 0);

    activity_service::run_pipeline(&state, manual(&created.id)).await.unwrap();

    let mut renamed = created.clone();
    renamed.name = "renamed".into();
    let updated = pipeline_service::update_pipeline(&state, renamed).await.unwrap();
    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.run_count, 1);
    assert!(updated.last_run_id.is_some());

    pipeline_service::delete_pipeline(&state, &created.id).await.unwrap();
    assert!(matches!(
        pipeline_service::get_pipeline(&state, &created.id).await,
        Err(PipelineError::NotFound(_))
    ));
    assert!(matches!(
        pipeline_service::delete_pipeline(&state, &created.id).await,
        Err(PipelineError::NotFound(_))
    ));
    // Runs outlive their pipeline
    assert_eq!(activity_service::list_activities(&state).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_activating_with_bad_schedule_is_rejected() {
    let (_fake, state) = setup();
    let mut pipeline = single_step();
    pipeline.cron_trigger = CronTrigger {
        spec: "not a schedule".into(),
        timezone: String::new(),
    };
    pipeline_service::create_pipeline(&state, pipeline).await.unwrap();

    let err = pipeline_service::set_active(&state, "p1", true).await.unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(_)));
    assert!(!pipeline_service::get_pipeline(&state, "p1").await.unwrap().is_activate);
}

#[tokio::test]
async fn test_cron_starts_due_pipelines() {
    let (fake, state) = setup();
    let mut pipeline = single_step();
    pipeline.is_activate = true;
    pipeline.cron_trigger = CronTrigger {
        spec: "*/5 * * * *".into(),
        timezone: "Europe/Berlin".into(),
    };
    let created = pipeline_service::create_pipeline(&state, pipeline).await.unwrap();
    assert!(created.next_run_time > 0);

    let cron = CronScheduler::new(state.clone(), Duration::from_secs(30));
    assert_eq!(cron.trigger_due(created.next_run_time - 1).await.unwrap(), 0);
    assert_eq!(cron.trigger_due(created.next_run_time).await.unwrap(), 1);

    let runs = activity_service::list_activities_by_pipeline(&state, "p1").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger_type, TriggerType::Cron);
    assert_eq!(runs[0].env_vars["CICD_TRIGGER_TYPE"], "cron");

    // A start that fails still moves the schedule on
    fake.set_workers(Vec::<String>::new());
    let mut stale = pipeline_service::get_pipeline(&state, "p1").await.unwrap();
    stale.next_run_time = 1;
    sluice_orchestrator::repository::pipeline_repository::update(state.store(), &stale)
        .await
        .unwrap();
    assert_eq!(cron.trigger_due(2).await.unwrap(), 0);
    assert!(pipeline_service::get_pipeline(&state, "p1").await.unwrap().next_run_time > 1);
}

#[tokio::test]
async fn test_poller_syncs_unfinished_activities() {
    let (fake, state) = setup();
    pipeline_service::create_pipeline(&state, single_step()).await.unwrap();
    let first = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();
    let second = activity_service::run_pipeline(&state, manual("p1")).await.unwrap();

    let poller = SyncPoller::new(state.clone(), Duration::from_secs(5), 4);
    assert_eq!(poller.sync_once().await.unwrap(), 0);

    fake.set_snapshot(
        &UnitRef::step(&first, 0, 0),
        InfoSnapshot::finished(
            UnitResult::Success,
            first.start_ts + 1_000,
            first.start_ts + 1_900,
            ONE_STEP_SUCCESS,
        ),
    );
    assert_eq!(poller.sync_once().await.unwrap(), 1);

    let unfinished = activity_service::list_unfinished(&state).await.unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].id, second.id);

    // The latest run is still building
    let pipeline = pipeline_service::get_pipeline(&state, "p1").await.unwrap();
    assert_eq!(pipeline.last_run_id.as_deref(), Some(second.id.as_str()));
    assert_eq!(pipeline.last_run_status, Some(Status::Building));
}

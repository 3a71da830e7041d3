//! Fake execution backend for testing

use async_trait::async_trait;
use sluice_core::domain::activity::Activity;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{BackendError, Result};
use crate::unit::{Handle, InfoSnapshot, UnitRef};
use crate::ExecutionBackend;

/// Recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Prepare { unit: String },
    Trigger { unit: String },
    Inspect { unit: String },
    Cancel { handle: Handle },
    DeleteArtifact { unit: String },
    ActiveWorkers,
    FetchLog { unit: String, start_line: usize },
    Exec { node: String, command: String },
}

#[derive(Default)]
struct FakeState {
    workers: Vec<String>,
    snapshots: HashMap<String, InfoSnapshot>,
    logs: HashMap<String, String>,
    failing_triggers: HashSet<String>,
    failing_cancels: HashSet<String>,
    failing_inspects: HashSet<String>,
    next_queue_id: u64,
}

/// In-memory backend with scripted answers
///
/// Snapshots are scripted per step unit; a step without a scripted snapshot
/// inspects as `None`. A stage unit inspects as the combination of its step
/// snapshots, the same way a real backend reports it.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with the given active workers
    pub fn with_workers<I, S>(workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fake = Self::new();
        fake.set_workers(workers);
        fake
    }

    pub fn set_workers<I, S>(&self, workers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().workers = workers.into_iter().map(Into::into).collect();
    }

    /// Script what `inspect` returns for the step unit `unit`
    pub fn set_snapshot(&self, unit: &UnitRef, snapshot: InfoSnapshot) {
        debug_assert!(!unit.is_stage(), "stage units combine their steps");
        self.state().snapshots.insert(unit.name.clone(), snapshot);
    }

    pub fn clear_snapshot(&self, unit: &UnitRef) {
        self.state().snapshots.remove(&unit.name);
    }

    /// Script the output `fetch_log` returns for `unit`
    pub fn set_log(&self, unit: &UnitRef, log: impl Into<String>) {
        self.state().logs.insert(unit.name.clone(), log.into());
    }

    /// Make `trigger` fail for `unit`
    pub fn fail_trigger(&self, unit: &UnitRef) {
        self.state().failing_triggers.insert(unit.name.clone());
    }

    /// Make `cancel` fail for handles of `unit`
    pub fn fail_cancel(&self, unit: &UnitRef) {
        self.state().failing_cancels.insert(unit.name.clone());
    }

    /// Make `inspect` fail for `unit`
    pub fn fail_inspect(&self, unit: &UnitRef) {
        self.state().failing_inspects.insert(unit.name.clone());
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Names of triggered units, in order
    pub fn triggered(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Trigger { unit } => Some(unit),
                _ => None,
            })
            .collect()
    }

    /// Names of prepared units, in order
    pub fn prepared(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Prepare { unit } => Some(unit),
                _ => None,
            })
            .collect()
    }

    /// Handles passed to `cancel`, in order
    pub fn cancelled(&self) -> Vec<Handle> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Cancel { handle } => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Commands run on workers, in order
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Exec { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: BackendCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn prepare(&self, activity: &Activity, stage: usize, step: usize) -> Result<UnitRef> {
        let unit = UnitRef::step(activity, stage, step);
        self.record(BackendCall::Prepare {
            unit: unit.name.clone(),
        });
        Ok(unit)
    }

    async fn trigger(&self, unit: &UnitRef, _params: &BTreeMap<String, String>) -> Result<Handle> {
        self.record(BackendCall::Trigger {
            unit: unit.name.clone(),
        });
        let mut state = self.state();
        if state.failing_triggers.contains(&unit.name) {
            return Err(BackendError::api_error(500, format!("cannot build {}", unit.name)));
        }
        state.next_queue_id += 1;
        Ok(Handle::Queued {
            id: state.next_queue_id,
        })
    }

    async fn inspect(&self, unit: &UnitRef) -> Result<Option<InfoSnapshot>> {
        self.record(BackendCall::Inspect {
            unit: unit.name.clone(),
        });
        let state = self.state();
        if state.failing_inspects.contains(&unit.name) {
            return Err(BackendError::State(format!("garbled answer for {}", unit.name)));
        }
        if !unit.is_stage() {
            return Ok(state.snapshots.get(&unit.name).cloned());
        }
        let steps = (0..unit.step_count)
            .filter_map(|step| state.snapshots.get(&unit.step_unit(step).name).cloned());
        Ok(InfoSnapshot::combine(steps, unit.not_before))
    }

    async fn cancel(&self, handle: &Handle) -> Result<()> {
        self.record(BackendCall::Cancel {
            handle: handle.clone(),
        });
        match handle {
            Handle::Run { unit } if self.state().failing_cancels.contains(unit) => {
                Err(BackendError::api_error(500, format!("cannot stop {unit}")))
            }
            _ => Ok(()),
        }
    }

    async fn delete_artifact(&self, unit: &UnitRef) -> Result<()> {
        self.record(BackendCall::DeleteArtifact {
            unit: unit.name.clone(),
        });
        self.state().snapshots.remove(&unit.name);
        Ok(())
    }

    async fn active_workers(&self) -> Result<Vec<String>> {
        self.record(BackendCall::ActiveWorkers);
        Ok(self.state().workers.clone())
    }

    async fn fetch_log(&self, unit: &UnitRef, start_line: usize) -> Result<String> {
        self.record(BackendCall::FetchLog {
            unit: unit.name.clone(),
            start_line,
        });
        let state = self.state();
        let log = state
            .logs
            .get(&unit.name)
            .ok_or_else(|| BackendError::NotFound(unit.name.clone()))?;
        Ok(log
            .split_inclusive('\n')
            .skip(start_line)
            .collect::<String>())
    }

    async fn exec_on_worker(&self, node: &str, command: &str) -> Result<String> {
        self.record(BackendCall::Exec {
            node: node.to_string(),
            command: command.to_string(),
        });
        Ok(String::new())
    }
}

//! Activity DTOs for the trigger API

use serde::{Deserialize, Serialize};

use crate::domain::activity::Status;
use crate::domain::pipeline::TriggerType;

/// Request to start a new activity of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPipeline {
    pub pipeline_id: String,
    #[serde(default)]
    pub trigger_type: TriggerType,
}

/// Request for the incremental log of one step
///
/// `cursor` is the text returned by the previous call, empty on the first one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepLogRequest {
    pub activity_id: String,
    pub stage: usize,
    pub step: usize,
    #[serde(default)]
    pub cursor: String,
}

/// Log text of one step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    /// Output of the step so far, with the command echo line removed
    pub text: String,
    /// Opaque cursor to pass back on the next call
    pub cursor: String,
}

/// Compact view of an activity for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub run_sequence: u32,
    pub status: Status,
    pub start_ts: i64,
    pub stop_ts: i64,
    pub trigger_type: TriggerType,
}

impl From<&crate::domain::activity::Activity> for ActivitySummary {
    fn from(a: &crate::domain::activity::Activity) -> Self {
        Self {
            id: a.id.clone(),
            pipeline_id: a.pipeline.id.clone(),
            pipeline_name: a.pipeline.name.clone(),
            run_sequence: a.run_sequence,
            status: a.status,
            start_ts: a.start_ts,
            stop_ts: a.stop_ts,
            trigger_type: a.trigger_type,
        }
    }
}

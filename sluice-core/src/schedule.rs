//! Cron schedule computation
//!
//! Computes the next trigger time of a time-based pipeline. Schedules use the
//! standard 5-field cron syntax (or `@daily` style descriptors) evaluated in
//! the pipeline's IANA timezone.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use croner::Cron;
use thiserror::Error;

use crate::domain::pipeline::{CronTrigger, Pipeline};

/// Schedule errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{spec}': {reason}")]
    InvalidSchedule { spec: String, reason: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Next trigger time of `pipeline` in epoch millis, or 0 when it is not scheduled
///
/// Inactive pipelines, empty schedules and unparseable schedules all yield 0;
/// use [`try_next_run_time`] to see why.
pub fn next_run_time(pipeline: &Pipeline, now: DateTime<Utc>) -> i64 {
    try_next_run_time(pipeline, now).unwrap_or(0)
}

/// Like [`next_run_time`] but reports schedule errors
pub fn try_next_run_time(pipeline: &Pipeline, now: DateTime<Utc>) -> Result<i64, ScheduleError> {
    if !pipeline.is_activate || pipeline.cron_trigger.spec.trim().is_empty() {
        return Ok(0);
    }
    next_after(&pipeline.cron_trigger, now)
}

/// First occurrence of `trigger` strictly after `now`, in epoch millis
pub fn next_after(trigger: &CronTrigger, now: DateTime<Utc>) -> Result<i64, ScheduleError> {
    let tz = parse_timezone(&trigger.timezone)?;
    let cron = Cron::new(trigger.spec.trim())
        .parse()
        .map_err(|e| ScheduleError::InvalidSchedule {
            spec: trigger.spec.clone(),
            reason: e.to_string(),
        })?;

    let mut from = now.with_timezone(&tz);
    // Occurrences are second-aligned; a sub-second `now` may land on the same second.
    for _ in 0..2 {
        let next = cron
            .find_next_occurrence(&from, false)
            .map_err(|e| ScheduleError::InvalidSchedule {
                spec: trigger.spec.clone(),
                reason: e.to_string(),
            })?;
        let millis = next.timestamp_millis();
        if millis > now.timestamp_millis() {
            return Ok(millis);
        }
        from = next + Duration::seconds(1);
    }
    Err(ScheduleError::InvalidSchedule {
        spec: trigger.spec.clone(),
        reason: "no future occurrence".to_string(),
    })
}

fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(chrono_tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// Epoch millis to a UTC timestamp, clamping out-of-range values to the epoch
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

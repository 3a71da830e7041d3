//! Background loops

mod cron;
mod poller;

pub use cron::CronScheduler;
pub use poller::SyncPoller;

//! Orchestrator configuration
//!
//! Storage, loop intervals and the execution backend connection.

use sluice_backend::rest::BackendConfig;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL; without one state is kept in memory
    pub database_url: Option<String>,

    /// How often unfinished activities are synced with the backend
    pub sync_interval: Duration,

    /// How often time-based pipelines are checked for due runs
    pub cron_interval: Duration,

    /// Max activities synced concurrently in one tick
    pub max_parallel_syncs: usize,

    /// Buffered resource-change notifications per subscriber
    pub event_capacity: usize,

    pub backend: BackendConfig,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            database_url: None,
            sync_interval: Duration::from_secs(5),
            cron_interval: Duration::from_secs(30),
            max_parallel_syncs: 8,
            event_capacity: 256,
            backend,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (optional, in-memory state when unset)
    /// - SYNC_INTERVAL (optional, seconds, default: 5)
    /// - CRON_INTERVAL (optional, seconds, default: 30)
    /// - MAX_PARALLEL_SYNCS (optional, default: 8)
    /// - EVENT_CAPACITY (optional, default: 256)
    /// - BACKEND_* (see [`BackendConfig::from_env`])
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let sync_interval = std::env::var("SYNC_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let cron_interval = std::env::var("CRON_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        let max_parallel_syncs = std::env::var("MAX_PARALLEL_SYNCS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(8);

        let event_capacity = std::env::var("EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(256);

        Ok(Self {
            database_url,
            sync_interval,
            cron_interval,
            max_parallel_syncs,
            event_capacity,
            backend: BackendConfig::from_env(),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_interval.is_zero() {
            anyhow::bail!("sync_interval must be greater than 0");
        }

        if self.cron_interval.is_zero() {
            anyhow::bail!("cron_interval must be greater than 0");
        }

        if self.max_parallel_syncs == 0 {
            anyhow::bail!("max_parallel_syncs must be greater than 0");
        }

        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity must be greater than 0");
        }

        self.backend.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

use anyhow::{Context, Result};
use sluice_backend::rest::RestBackend;
use sluice_orchestrator::config::Config;
use sluice_orchestrator::engine::{Driver, cleanup};
use sluice_orchestrator::events::EventBus;
use sluice_orchestrator::scheduler::{CronScheduler, SyncPoller};
use sluice_orchestrator::store::{DocumentStore, MemoryStore, PgDocumentStore};
use sluice_orchestrator::{AppState, db};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_orchestrator=debug,sluice_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sluice Orchestrator...");

    let config = load_config()?;
    info!(
        "Loaded configuration: backend={}, sync_interval={:?}, cron_interval={:?}",
        config.backend.server_address, config.sync_interval, config.cron_interval
    );

    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = connect_with_retry(url).await?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let backend = RestBackend::new(config.backend.clone()).context("Failed to create backend client")?;
    let driver = Driver::new(Arc::new(backend))
        .with_hooks(cleanup::default_hooks(&config.backend.workspace_root));
    let state = AppState::new(store, driver, EventBus::new(config.event_capacity));

    spawn_event_logger(&state.events);

    let poller = SyncPoller::new(state.clone(), config.sync_interval, config.max_parallel_syncs);
    let cron = CronScheduler::new(state, config.cron_interval);

    info!("Orchestrator initialized successfully");

    tokio::select! {
        result = poller.run() => result.context("Sync poller stopped")?,
        result = cron.run() => result.context("Cron scheduler stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(_) => {
            info!("Failed to load config from environment, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Connect to the database with exponential backoff
///
/// The database may still be starting when the orchestrator comes up.
async fn connect_with_retry(database_url: &str) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(database_url).await {
            Ok(pool) => {
                info!("Database connection pool created");
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to create database pool: {}", e));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

/// Logs every resource change at debug level
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => debug!("Resource changed: {}", change),
                Err(RecvError::Lagged(missed)) => warn!("Event logger missed {} changes", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

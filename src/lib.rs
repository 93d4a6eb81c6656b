//! # Planner Sync
//!
//! Offline-first sync queue for the planner app: local record mutations are
//! queued durably and delivered to the remote backend when it is reachable.

pub mod config;
pub mod db;
pub mod sync;

use config::{AppConfig, ConfigError};
use db::{Database, DbError};
use std::sync::Arc;
use std::time::Duration;
use sync::{
    BackgroundScheduler, QueueError, QueueStore, RemoteBackend, RemoteError, RestBackendClient,
    SchedulerError, SyncQueueHandle,
};

/// How often an unreachable backend is probed
const PROBE_INTERVAL_SECS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Backend client error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Service Entry Point
// ============================================================================

pub async fn run() -> Result<(), AppError> {
    // Load .env file for backend credentials
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    log::info!("Database path: {:?}", config.database_path);

    let db = Arc::new(Database::new(config.database_path.clone())?);
    log::info!("Database initialized successfully");

    let client = Arc::new(RestBackendClient::new(&config.backend_url, config.api_key.clone())?);
    match config.session() {
        Some(session) => client.set_session(session).await,
        None => log::warn!("No session configured; queued operations wait for sign-in"),
    }

    let backend: Arc<dyn RemoteBackend> = client.clone();
    let queue = SyncQueueHandle::spawn(QueueStore::new(db.clone()), backend);
    log::info!("Sync queue started with {} pending operations", queue.queue_info().total);

    // Deliver whatever survived the last run
    queue.trigger_processing()?;

    let scheduler = BackgroundScheduler::new(db.clone(), queue.clone());
    scheduler.load_config().await?;
    if scheduler.get_config().await.enabled {
        scheduler.start().await?;
    } else {
        log::info!("Background scheduler disabled in settings");
    }

    let probe = tokio::spawn(probe_loop(client));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");

    probe.abort();
    if scheduler.is_running() {
        scheduler.stop().await?;
    }
    drop(scheduler);

    // Waits for the worker's final persist
    queue.shutdown().await?;

    let info = queue.queue_info();
    log::info!(
        "Exiting with {} queued operations ({} failed)",
        info.total, info.failed
    );
    Ok(())
}

/// Poll the backend while it is unreachable so the scheduler sees the
/// offline -> online transition
async fn probe_loop(client: Arc<RestBackendClient>) {
    let mut interval = tokio::time::interval(Duration::from_secs(PROBE_INTERVAL_SECS));
    loop {
        interval.tick().await;
        if !client.is_connected() {
            client.probe_connectivity().await;
        }
    }
}

//! Background Sync Scheduler
//!
//! Drives the queue on a fixed interval: each tick runs a pass, then purges
//! stale operations. Ticks go through `SyncQueueHandle::process_queue`, whose
//! worker rejects overlapping passes. The connectivity-restored trigger lives
//! in the worker itself, so it keeps working while the scheduler is disabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use chrono::Utc;
use crate::db::Database;
use super::engine::{PassOutcome, QueueError, SyncQueueHandle};

const CONFIG_KEY: &str = "sync_queue_scheduler";
const MAX_INTERVAL_SECS: u64 = 3600;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            last_run: None,
        }
    }
}

/// Background scheduler for automatic queue processing
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    queue: SyncQueueHandle,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_secs: u64) -> Result<(), SchedulerError> {
    if interval_secs < 1 || interval_secs > MAX_INTERVAL_SECS {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-{} seconds, got {}",
            MAX_INTERVAL_SECS, interval_secs
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>, queue: SyncQueueHandle) -> Self {
        Self {
            db,
            queue,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self.db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_secs = self.config.read().await.interval_secs;
        validate_interval(interval_secs)?;

        self.running.store(true, Ordering::Relaxed);

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.scheduler_loop(interval_secs).await;
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Background scheduler started (interval: {} seconds)", interval_secs);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        self.running.store(false, Ordering::Relaxed);

        let handle = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            // Wait for the task to drop its queue handle
            let _ = handle.await;
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(&self, enabled: bool, interval_secs: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_secs)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_secs = interval_secs;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start().await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={} seconds", enabled, interval_secs);
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(self, interval_secs: u64) {
        let period = std::time::Duration::from_secs(interval_secs);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let result = self.run_scheduled_pass().await;

            if !self.running.load(Ordering::Relaxed) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            if let Err(e) = result {
                log::error!("Scheduler loop: {}", e);
                break;
            }
        }

        self.running.store(false, Ordering::Relaxed);
        log::info!("Scheduler loop exited");
    }

    async fn run_scheduled_pass(&self) -> Result<(), QueueError> {
        log::debug!("Queue processing triggered by scheduler");

        log_outcome(self.queue.process_queue().await?);
        self.queue.clear_stale_operations().await?;

        let config = {
            let mut cfg = self.config.write().await;
            cfg.last_run = Some(Utc::now().to_rfc3339());
            cfg.clone()
        };
        if let Err(e) = self.db.set_setting(CONFIG_KEY, &config) {
            log::error!("Failed to save last_run timestamp: {}", e);
        }

        Ok(())
    }
}

fn log_outcome(outcome: PassOutcome) {
    match outcome {
        PassOutcome::Completed(report) if report.failed > 0 => {
            log::warn!(
                "Scheduled pass had {} failed attempts ({} succeeded)",
                report.failed, report.succeeded
            );
        }
        PassOutcome::Completed(report) => {
            log::debug!("Scheduled pass finished: {} succeeded", report.succeeded);
        }
        PassOutcome::Skipped(reason) => {
            log::debug!("Scheduled pass skipped: {:?}", reason);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

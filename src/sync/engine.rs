//! Sync Queue Engine - single-owner worker driving delivery
//!
//! One worker task owns the queue, the statistics and the persisted snapshot.
//! Callers talk to it through `SyncQueueHandle` (commands over an mpsc
//! channel) and observe it through `QueueSnapshot`s published on a watch
//! channel. Network attempts run in spawned tasks and report back on a second
//! channel, so the worker keeps answering commands while an attempt is
//! outstanding. The worker also watches the backend's connection state and
//! starts a pass whenever it goes from offline to online.
//!
//! A processing pass:
//! 1. sweeps retired record kinds
//! 2. snapshots the eligible operations (not in flight, due per backoff)
//! 3. attempts them one at a time, in queue order
//! 4. persists the queue once when the last attempt has reported

use super::api::{RemoteBackend, RemoteError};
use super::models::{ConnectionState, SyncAction};
use super::queue::{Operation, QueueInfo};
use super::stats::QueueStatistics;
use super::store::QueueStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

// ============================================================================
// Clock
// ============================================================================

/// Time source for backoff and staleness decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Public Types
// ============================================================================

/// Point-in-time view of the queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub operations: Vec<Operation>,
    pub is_processing: bool,
    pub processing_progress: f64,
    pub last_process_time: Option<DateTime<Utc>>,
    pub statistics: QueueStatistics,
}

impl QueueSnapshot {
    pub fn info(&self) -> QueueInfo {
        QueueInfo::from_operations(&self.operations)
    }
}

/// Why `process_queue` returned without running a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyProcessing,
    EmptyQueue,
}

/// Counts for one finished pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Operations that reached the retry ceiling during this pass
    pub exhausted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    Skipped(SkipReason),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Sync queue worker is not running")]
    WorkerStopped,
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Enqueue {
        operation: Operation,
        ack: oneshot::Sender<bool>,
    },
    Dequeue {
        id: Uuid,
        ack: oneshot::Sender<bool>,
    },
    Clear {
        ack: oneshot::Sender<()>,
    },
    ClearStale {
        ack: oneshot::Sender<usize>,
    },
    Process {
        reply: Option<oneshot::Sender<PassOutcome>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to the queue worker
#[derive(Clone)]
pub struct SyncQueueHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<QueueSnapshot>,
}

impl SyncQueueHandle {
    /// Load the persisted queue and spawn the worker on the current runtime
    pub fn spawn(store: QueueStore, backend: Arc<dyn RemoteBackend>) -> Self {
        Self::spawn_with_clock(store, backend, Arc::new(SystemClock))
    }

    pub fn spawn_with_clock(
        store: QueueStore,
        backend: Arc<dyn RemoteBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let operations = store.load();
        Self::spawn_preloaded(operations, store, backend, clock)
    }

    /// Spawn the worker over `operations` instead of the persisted snapshot
    pub(crate) fn spawn_preloaded(
        operations: Vec<Operation>,
        store: QueueStore,
        backend: Arc<dyn RemoteBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut connectivity = backend.connection_state();
        let was_online = connectivity.borrow_and_update().is_online();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(QueueSnapshot {
            operations: operations.clone(),
            ..QueueSnapshot::default()
        });

        let worker = QueueWorker {
            operations,
            statistics: QueueStatistics::default(),
            pass: None,
            last_process_time: None,
            store,
            backend,
            clock,
            connectivity,
            was_online,
            commands: commands_rx,
            attempts_tx,
            attempts: attempts_rx,
            state: state_tx,
        };
        tokio::spawn(worker.run());

        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Add an operation; `Ok(false)` if its record kind is retired
    ///
    /// Resolves once the operation is recorded and persisted, never waiting
    /// on delivery.
    pub async fn enqueue(&self, operation: Operation) -> Result<bool, QueueError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Enqueue { operation, ack })?;
        rx.await.map_err(|_| QueueError::WorkerStopped)
    }

    /// Remove an operation by id; `Ok(false)` if it was not queued
    pub async fn dequeue(&self, id: Uuid) -> Result<bool, QueueError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Dequeue { id, ack })?;
        rx.await.map_err(|_| QueueError::WorkerStopped)
    }

    /// Drop every operation and reset statistics
    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Clear { ack })?;
        rx.await.map_err(|_| QueueError::WorkerStopped)
    }

    /// Purge stale operations; returns how many were removed
    pub async fn clear_stale_operations(&self) -> Result<usize, QueueError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::ClearStale { ack })?;
        rx.await.map_err(|_| QueueError::WorkerStopped)
    }

    /// Run a processing pass and wait for it to finish
    pub async fn process_queue(&self) -> Result<PassOutcome, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Process { reply: Some(reply) })?;
        rx.await.map_err(|_| QueueError::WorkerStopped)
    }

    /// Start a processing pass without waiting for it
    pub fn trigger_processing(&self) -> Result<(), QueueError> {
        self.send(Command::Process { reply: None })
    }

    /// Stop the worker; resolves after the final snapshot is persisted
    ///
    /// Other handles fail with `WorkerStopped` afterwards. A pass still
    /// running is abandoned and its caller gets `WorkerStopped`.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Shutdown { ack })?;
        rx.await.map_err(|_| QueueError::WorkerStopped)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.state.clone()
    }

    pub fn queue_info(&self) -> QueueInfo {
        self.state.borrow().info()
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.state.borrow().statistics.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), QueueError> {
        self.commands.send(command).map_err(|_| QueueError::WorkerStopped)
    }
}

// ============================================================================
// Worker
// ============================================================================

struct AttemptDone {
    id: Uuid,
    result: Result<(), RemoteError>,
}

struct ActivePass {
    pending: VecDeque<Uuid>,
    total: usize,
    completed: usize,
    report: PassReport,
    reply: Option<oneshot::Sender<PassOutcome>>,
}

impl ActivePass {
    fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

struct QueueWorker {
    operations: Vec<Operation>,
    statistics: QueueStatistics,
    pass: Option<ActivePass>,
    last_process_time: Option<DateTime<Utc>>,
    store: QueueStore,
    backend: Arc<dyn RemoteBackend>,
    clock: Arc<dyn Clock>,
    connectivity: watch::Receiver<ConnectionState>,
    was_online: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    attempts_tx: mpsc::UnboundedSender<AttemptDone>,
    attempts: mpsc::UnboundedReceiver<AttemptDone>,
    state: watch::Sender<QueueSnapshot>,
}

impl QueueWorker {
    async fn run(mut self) {
        log::info!("Sync queue worker started ({} operations loaded)", self.operations.len());

        let mut watching = true;
        let mut stop_ack = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(ack) = self.handle_command(command) {
                            stop_ack = Some(ack);
                            break;
                        }
                    }
                    None => break,
                },
                Some(done) = self.attempts.recv() => self.finish_attempt(done),
                changed = self.connectivity.changed(), if watching => {
                    if changed.is_err() {
                        log::warn!("Connection state source closed; connectivity trigger disabled");
                        watching = false;
                    } else {
                        self.connectivity_changed();
                    }
                }
            }
        }

        self.shutdown();
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    fn connectivity_changed(&mut self) {
        let online = self.connectivity.borrow_and_update().is_online();
        let restored = online && !self.was_online;
        self.was_online = online;

        if restored {
            log::info!("Connectivity restored, processing sync queue");
            self.start_pass(None);
        }
    }

    /// Apply a command; returns the acknowledgement when it asks the worker to stop
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Enqueue { operation, ack } => {
                let _ = ack.send(self.enqueue(operation));
            }
            Command::Dequeue { id, ack } => {
                let _ = ack.send(self.dequeue(id));
            }
            Command::Clear { ack } => {
                self.clear();
                let _ = ack.send(());
            }
            Command::ClearStale { ack } => {
                let _ = ack.send(self.clear_stale());
            }
            Command::Process { reply } => self.start_pass(reply),
            Command::Shutdown { ack } => return Some(ack),
        }
        None
    }

    fn enqueue(&mut self, operation: Operation) -> bool {
        if operation.data_type.is_legacy() {
            log::warn!(
                "Rejected {} operation for retired type {}",
                operation.action, operation.data_type
            );
            return false;
        }

        log::info!(
            "Queued {} {} operation {}",
            operation.data_type, operation.action, operation.id
        );
        self.statistics.record_queued(operation.data_type);
        self.operations.push(operation);
        self.persist();
        self.publish();

        if self.pass.is_none() && self.backend.is_online() {
            self.start_pass(None);
        }
        true
    }

    fn dequeue(&mut self, id: Uuid) -> bool {
        let before = self.operations.len();
        self.operations.retain(|op| op.id != id);
        let removed = self.operations.len() != before;

        self.persist();
        self.publish();
        removed
    }

    fn clear(&mut self) {
        log::info!("Clearing sync queue ({} operations)", self.operations.len());
        self.operations.clear();
        self.statistics.reset();
        self.persist();
        self.publish();
    }

    fn clear_stale(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.operations.len();
        self.operations.retain(|op| !op.is_stale_at(now));
        let removed = before - self.operations.len();

        if removed > 0 {
            self.persist();
            self.publish();
        }
        log::info!("Cleared {} stale operations", removed);
        removed
    }

    fn start_pass(&mut self, reply: Option<oneshot::Sender<PassOutcome>>) {
        let skip = if !self.backend.is_online() {
            Some(SkipReason::Offline)
        } else if self.pass.is_some() {
            Some(SkipReason::AlreadyProcessing)
        } else if self.operations.is_empty() {
            Some(SkipReason::EmptyQueue)
        } else {
            None
        };

        if let Some(reason) = skip {
            log::debug!("Skipping queue processing: {:?}", reason);
            if let Some(reply) = reply {
                let _ = reply.send(PassOutcome::Skipped(reason));
            }
            return;
        }

        let before = self.operations.len();
        self.operations.retain(|op| !op.data_type.is_legacy());
        if self.operations.len() != before {
            log::warn!("Removed {} operations of retired types", before - self.operations.len());
            self.persist();
        }

        let now = self.clock.now();
        let pending: VecDeque<Uuid> = self
            .operations
            .iter()
            .filter(|op| !op.in_flight && op.should_retry_at(now))
            .map(|op| op.id)
            .collect();

        log::info!(
            "Processing sync queue: {} eligible of {} queued",
            pending.len(),
            self.operations.len()
        );

        self.pass = Some(ActivePass {
            total: pending.len(),
            pending,
            completed: 0,
            report: PassReport::default(),
            reply,
        });
        self.publish();
        self.advance_pass();
    }

    /// Launch the next attempt, or finish the pass when none remain
    fn advance_pass(&mut self) {
        loop {
            let Some(pass) = self.pass.as_mut() else {
                return;
            };
            let Some(id) = pass.pending.pop_front() else {
                self.finish_pass();
                return;
            };

            let Some(operation) = self.operations.iter_mut().find(|op| op.id == id) else {
                // Removed since the pass started
                pass.completed += 1;
                continue;
            };

            operation.in_flight = true;
            pass.report.attempted += 1;
            let operation = operation.clone();
            self.publish();

            log::debug!(
                "Attempting {} {} operation {} (retry {})",
                operation.data_type, operation.action, operation.id, operation.retry_count
            );

            let backend = Arc::clone(&self.backend);
            let done = self.attempts_tx.clone();
            let id = operation.id;
            tokio::spawn(async move {
                // A panicking backend must still report, or the pass never ends
                let attempt = tokio::spawn(async move {
                    deliver(backend.as_ref(), &operation).await
                });
                let result = match attempt.await {
                    Ok(result) => result,
                    Err(e) => Err(RemoteError::AttemptAborted(e.to_string())),
                };
                let _ = done.send(AttemptDone { id, result });
            });
            return;
        }
    }

    fn finish_attempt(&mut self, done: AttemptDone) {
        let now = self.clock.now();
        let index = self.operations.iter().position(|op| op.id == done.id);
        let Some(pass) = self.pass.as_mut() else {
            log::debug!("Attempt for {} reported outside of a pass", done.id);
            return;
        };

        match (index, done.result) {
            (None, _) => {
                log::debug!("Operation {} left the queue during its attempt", done.id);
            }
            (Some(index), Ok(())) => {
                let operation = self.operations.remove(index);
                log::info!(
                    "Synced {} {} operation {}",
                    operation.data_type, operation.action, operation.id
                );
                self.statistics.record_processed(operation.data_type);
                pass.report.succeeded += 1;
                if let Err(e) = self.store.save(&self.operations) {
                    log::error!("Failed to persist sync queue: {}", e);
                }
            }
            (Some(index), Err(e)) => {
                let operation = &mut self.operations[index];
                operation.record_failure(now);
                self.statistics.record_retried(operation.data_type);
                pass.report.failed += 1;

                if operation.is_exhausted() {
                    self.statistics.record_failed(operation.data_type);
                    pass.report.exhausted += 1;
                    log::warn!(
                        "Operation {} failed permanently after {} attempts: {}",
                        operation.id, operation.retry_count, e
                    );
                } else {
                    log::warn!(
                        "Operation {} failed (attempt {}), will retry: {}",
                        operation.id, operation.retry_count, e
                    );
                }
            }
        }

        pass.completed += 1;
        self.publish();
        self.advance_pass();
    }

    fn finish_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return;
        };

        self.persist();
        self.last_process_time = Some(self.clock.now());
        self.publish();

        log::info!(
            "Queue processing complete: {} attempted, {} succeeded, {} failed",
            pass.report.attempted, pass.report.succeeded, pass.report.failed
        );

        if let Some(reply) = pass.reply {
            let _ = reply.send(PassOutcome::Completed(pass.report));
        }
    }

    fn shutdown(&mut self) {
        // Handles report `WorkerStopped` from here on
        self.commands.close();
        if self.pass.take().is_some() {
            log::warn!("Sync queue stopped during a pass; unfinished attempts will be retried");
        }
        for op in self.operations.iter_mut() {
            op.in_flight = false;
        }
        self.persist();
        self.publish();
        log::info!("Sync queue worker stopped ({} operations persisted)", self.operations.len());
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.operations) {
            log::error!("Failed to persist sync queue: {}", e);
        }
    }

    fn publish(&self) {
        let snapshot = QueueSnapshot {
            operations: self.operations.clone(),
            is_processing: self.pass.is_some(),
            processing_progress: self.pass.as_ref().map(ActivePass::progress).unwrap_or(0.0),
            last_process_time: self.last_process_time,
            statistics: self.statistics.clone(),
        };
        self.state.send_replace(snapshot);
    }
}

/// Deliver one operation to the backend
async fn deliver(backend: &dyn RemoteBackend, operation: &Operation) -> Result<(), RemoteError> {
    backend.ensure_valid_token().await?;

    let table = operation.data_type.table_name();
    match operation.action {
        SyncAction::Create => backend.insert(table, &operation.payload).await,
        SyncAction::Update => {
            let id = operation.record_id().ok_or(RemoteError::MissingRecordId)?;
            backend.update(table, &operation.payload, &id).await
        }
        SyncAction::Delete => {
            let id = operation.record_id().ok_or(RemoteError::MissingRecordId)?;
            backend.delete(table, &id).await
        }
    }
}

//! Sync Module - Offline-first mutation queue
//!
//! Buffers local create/update/delete operations on planner records and
//! propagates them to the remote backend when it is reachable:
//! - Operations persisted across restarts (SQLite settings table)
//! - Fixed backoff between attempts, hard retry ceiling
//! - Per record kind outcome statistics
//!
//! Architecture:
//! - Single writer: one worker task owns the queue, callers send commands
//! - Three triggers: post-enqueue, fixed-interval timer, connectivity restored

pub mod models;
pub mod queue;
pub mod stats;
pub mod store;
pub mod api;
pub mod engine;
pub mod scheduler;


// Re-export commonly used types
pub use models::{
    DataType, UnknownDataType, SyncAction, Payload, PayloadValue, ConnectionState, payload_to_json,
};

pub use queue::{Operation, QueueInfo, retry_delay, MAX_RETRIES};
pub use stats::QueueStatistics;
pub use store::{QueueStore, StoreError};
pub use api::{RemoteBackend, RestBackendClient, RemoteError, Session};
pub use engine::{
    SyncQueueHandle, QueueSnapshot, PassOutcome, PassReport, SkipReason, QueueError,
    Clock, SystemClock,
};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};

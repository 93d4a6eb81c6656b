//! Durable queue store
//!
//! The whole operation list is kept as one JSON value in the `settings`
//! table. Writes serialize first and replace the row in a single statement,
//! so a failed save leaves the previous snapshot untouched.

use super::queue::Operation;
use crate::db::{Database, DbError};
use std::sync::Arc;

const QUEUE_STORAGE_KEY: &str = "sync_queue_operations";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Persists the sync queue snapshot
#[derive(Clone)]
pub struct QueueStore {
    db: Arc<Database>,
}

impl QueueStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Replace the persisted snapshot with `operations`
    pub fn save(&self, operations: &[Operation]) -> Result<(), StoreError> {
        let json = serde_json::to_string(operations)?;
        self.db.set_setting_raw(QUEUE_STORAGE_KEY, &json)?;
        log::debug!("Persisted {} queued operations", operations.len());
        Ok(())
    }

    /// Load the persisted snapshot
    ///
    /// Missing or unreadable state yields an empty queue. Attempts cannot
    /// outlive the process, so `in_flight` is cleared on the way in, and
    /// retired record kinds are dropped.
    pub fn load(&self) -> Vec<Operation> {
        let json = match self.db.get_setting_raw(QUEUE_STORAGE_KEY) {
            Ok(Some(json)) => json,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("Failed to read persisted sync queue: {}", e);
                return Vec::new();
            }
        };

        let mut operations: Vec<Operation> = match serde_json::from_str(&json) {
            Ok(operations) => operations,
            Err(e) => {
                log::warn!("Discarding unreadable sync queue snapshot: {}", e);
                return Vec::new();
            }
        };

        let before = operations.len();
        operations.retain(|op| !op.data_type.is_legacy());
        if operations.len() != before {
            log::warn!("Dropped {} retired operations from persisted queue", before - operations.len());
        }

        for op in operations.iter_mut() {
            op.in_flight = false;
        }

        log::info!("Loaded {} queued operations", operations.len());
        operations
    }
}

//! Queue statistics - per record kind outcome counters
//!
//! Counters live for the lifetime of the process and are only reset by an
//! explicit queue clear.

use super::models::DataType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome counters keyed by `DataType::as_str()`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub queued: HashMap<String, u64>,
    pub processed: HashMap<String, u64>,
    pub retried: HashMap<String, u64>,
    pub failed: HashMap<String, u64>,
}

fn bump(bucket: &mut HashMap<String, u64>, data_type: DataType) {
    *bucket.entry(data_type.as_str().to_string()).or_insert(0) += 1;
}

impl QueueStatistics {
    pub fn record_queued(&mut self, data_type: DataType) {
        bump(&mut self.queued, data_type);
    }

    pub fn record_processed(&mut self, data_type: DataType) {
        bump(&mut self.processed, data_type);
    }

    pub fn record_retried(&mut self, data_type: DataType) {
        bump(&mut self.retried, data_type);
    }

    pub fn record_failed(&mut self, data_type: DataType) {
        bump(&mut self.failed, data_type);
    }

    pub fn total_queued(&self) -> u64 {
        self.queued.values().sum()
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.values().sum()
    }

    pub fn total_retried(&self) -> u64 {
        self.retried.values().sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.values().sum()
    }

    /// processed / (processed + failed), 1.0 before any outcome
    pub fn success_rate(&self) -> f64 {
        let processed = self.total_processed();
        let denominator = processed + self.total_failed();
        if denominator == 0 {
            1.0
        } else {
            processed as f64 / denominator as f64
        }
    }

    pub fn reset(&mut self) {
        self.queued.clear();
        self.processed.clear();
        self.retried.clear();
        self.failed.clear();
    }
}

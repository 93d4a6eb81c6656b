//! Offline Queue Module - Pending mutations with retry bookkeeping
//!
//! Every local create/update/delete becomes an `Operation` that waits in the
//! queue until the backend accepts it.
//!
//! Features:
//! - Fixed backoff schedule (30s, 2m, 5m) between failed attempts
//! - Max retry limit (3 attempts), after which an operation stays queued as failed
//! - 24 hour staleness window used for queue hygiene

use super::models::{DataType, Payload, PayloadValue, SyncAction};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Delay before the next attempt, indexed by failures so far (last value repeats)
const BACKOFF_SCHEDULE_SECS: [i64; 3] = [30, 120, 300];
pub const MAX_RETRIES: u32 = 3;
const STALE_AFTER_HOURS: i64 = 24;

/// Minimum wait after the `retry_count`-th failure before the next attempt
pub fn retry_delay(retry_count: u32) -> Duration {
    let index = (retry_count.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::seconds(BACKOFF_SCHEDULE_SECS[index])
}

// ============================================================================
// Data Types
// ============================================================================

/// A queued mutation of one remote record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    pub data_type: DataType,
    pub action: SyncAction,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_flight: bool,
}

impl Operation {
    /// Create new operation, ready for its first attempt
    pub fn new(data_type: DataType, action: SyncAction, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_type,
            action,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
            in_flight: false,
        }
    }

    /// Older than the retention window
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::hours(STALE_AFTER_HOURS)
    }

    /// Check if the operation is due for an attempt now
    pub fn should_retry(&self) -> bool {
        self.should_retry_at(Utc::now())
    }

    pub fn should_retry_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_exhausted() {
            return false;
        }

        match self.last_retry_at {
            None => true,
            Some(last) => now - last > retry_delay(self.retry_count),
        }
    }

    /// Retry ceiling reached; never attempted again
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_RETRIES
    }

    /// Remote row id carried in the payload
    ///
    /// Strings are used verbatim, integers in decimal. Anything else counts as missing.
    pub fn record_id(&self) -> Option<String> {
        match self.payload.get("id") {
            Some(PayloadValue::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(PayloadValue::Int(id)) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Book a failed attempt
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        self.in_flight = false;
    }
}

/// Point-in-time queue summary for status displays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub oldest_operation: Option<DateTime<Utc>>,
}

impl QueueInfo {
    pub fn from_operations(operations: &[Operation]) -> Self {
        let in_flight = operations.iter().filter(|op| op.in_flight).count();

        Self {
            total: operations.len(),
            pending: operations.len() - in_flight,
            in_flight,
            failed: operations.iter().filter(|op| op.is_exhausted()).count(),
            oldest_operation: operations.iter().map(|op| op.created_at).min(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn update_op(id: Option<PayloadValue>) -> Operation {
        let mut payload = Payload::new();
        payload.insert("title".into(), "Lab report".into());
        if let Some(id) = id {
            payload.insert("id".into(), id);
        }
        Operation::new(DataType::Assignments, SyncAction::Update, payload)
    }

    #[test]
    fn test_operation_creation() {
        let op = update_op(None);
        assert_eq!(op.retry_count, 0);
        assert!(op.last_retry_at.is_none());
        assert!(!op.in_flight);
        assert!(op.should_retry());
        assert!(!op.is_stale());
    }

    #[test]
    fn test_retry_count_after_failures() {
        let mut op = update_op(None);
        let now = Utc::now();

        for n in 1..=5u32 {
            op.in_flight = true;
            op.record_failure(now);
            assert_eq!(op.retry_count, n);
            assert!(!op.in_flight);
            assert_eq!(op.last_retry_at, Some(now));
            assert_eq!(op.is_exhausted(), n >= MAX_RETRIES);
        }
    }

    #[test]
    fn test_should_retry_respects_backoff() {
        let mut op = update_op(None);
        let failed_at = Utc::now();
        op.record_failure(failed_at);

        assert!(!op.should_retry_at(failed_at + Duration::seconds(30)));
        assert!(op.should_retry_at(failed_at + Duration::seconds(31)));

        op.record_failure(failed_at);
        assert!(!op.should_retry_at(failed_at + Duration::seconds(120)));
        assert!(op.should_retry_at(failed_at + Duration::seconds(121)));
    }

    #[test]
    fn test_should_retry_false_at_ceiling() {
        let mut op = update_op(None);
        let failed_at = Utc::now();
        for _ in 0..MAX_RETRIES {
            op.record_failure(failed_at);
        }

        assert!(!op.should_retry_at(failed_at + Duration::days(2)));
    }

    #[test]
    fn test_backoff_monotonic() {
        let delays: Vec<Duration> = (0..6).map(retry_delay).collect();
        assert_eq!(delays[1], Duration::seconds(30));
        assert_eq!(delays[2], Duration::seconds(120));
        assert_eq!(delays[3], Duration::seconds(300));
        assert_eq!(delays[5], Duration::seconds(300));

        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn test_staleness() {
        let mut op = update_op(None);
        let now = Utc::now();

        op.created_at = now - Duration::hours(23);
        assert!(!op.is_stale_at(now));

        op.created_at = now - Duration::hours(25);
        assert!(op.is_stale_at(now));
    }

    #[test]
    fn test_record_id() {
        assert_eq!(update_op(Some("abc".into())).record_id().as_deref(), Some("abc"));
        assert_eq!(update_op(Some(42i64.into())).record_id().as_deref(), Some("42"));
        assert_eq!(update_op(Some("".into())).record_id(), None);
        assert_eq!(update_op(Some(PayloadValue::Bool(true))).record_id(), None);
        assert_eq!(update_op(None).record_id(), None);
    }

    #[test]
    fn test_persisted_field_names() {
        let op = update_op(Some("abc".into()));
        let json = serde_json::to_value(&op).unwrap();

        for field in ["id", "dataType", "action", "payload", "createdAt", "retryCount", "lastRetryAt", "inFlight"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(json["dataType"], "assignments");
        assert_eq!(json["action"], "update");
    }

    #[test]
    fn test_queue_info() {
        let now = Utc::now();
        let mut first = update_op(None);
        first.created_at = now - Duration::hours(2);
        let mut second = update_op(None);
        second.in_flight = true;
        let mut third = update_op(None);
        third.retry_count = MAX_RETRIES;

        let info = QueueInfo::from_operations(&[first.clone(), second, third]);
        assert_eq!(info.total, 3);
        assert_eq!(info.pending, 2);
        assert_eq!(info.in_flight, 1);
        assert_eq!(info.failed, 1);
        assert_eq!(info.oldest_operation, Some(first.created_at));

        assert_eq!(QueueInfo::from_operations(&[]), QueueInfo::default());
    }
}

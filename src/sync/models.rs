//! Sync Data Models - Record kinds, actions and payload values
//!
//! Data Categories:
//! - DataType: synchronizable planner record kinds (one remote table each)
//! - SyncAction: the mutation applied to a remote row
//! - PayloadValue / Payload: the dynamically-typed row being written
//! - ConnectionState: backend reachability as observed by the queue

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Record Kinds
// ============================================================================

/// Synchronizable record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Calendars,
    Assignments,
    Categories,
    Courses,
    Events,
    Schedules,
    /// Retired kind. Never accepted into the queue.
    ScheduleItems,
}

impl DataType {
    /// Raw value, also the remote table name
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Calendars => "calendars",
            DataType::Assignments => "assignments",
            DataType::Categories => "categories",
            DataType::Courses => "courses",
            DataType::Events => "events",
            DataType::Schedules => "schedules",
            DataType::ScheduleItems => "schedule_items",
        }
    }

    /// Remote table the rows of this kind live in
    pub fn table_name(&self) -> &'static str {
        self.as_str()
    }

    /// Whether this kind is rejected at enqueue time
    pub fn is_legacy(&self) -> bool {
        matches!(self, DataType::ScheduleItems)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown data type: {0}")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calendars" => Ok(DataType::Calendars),
            "assignments" => Ok(DataType::Assignments),
            "categories" => Ok(DataType::Categories),
            "courses" => Ok(DataType::Courses),
            "events" => Ok(DataType::Events),
            "schedules" => Ok(DataType::Schedules),
            "schedule_items" => Ok(DataType::ScheduleItems),
            other => Err(UnknownDataType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation applied to a remote row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Row written to the backend, keyed by column name
pub type Payload = BTreeMap<String, PayloadValue>;

/// Dynamically-typed payload value
///
/// Serialized as plain JSON. Variant order matters for decoding: integers are
/// tried before floats so `3` stays an `Int` while `3.0` decodes as a `Float`.
/// Integers outside the `i64` range have no exact variant and decode as a
/// `Float`, losing precision past 2^53.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Int(value)
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Int(i64::from(value))
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Float(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::String(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::String(value)
    }
}

impl<T: Into<PayloadValue>> From<Option<T>> for PayloadValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PayloadValue::Null)
    }
}

impl From<Vec<PayloadValue>> for PayloadValue {
    fn from(value: Vec<PayloadValue>) -> Self {
        PayloadValue::List(value)
    }
}

impl From<BTreeMap<String, PayloadValue>> for PayloadValue {
    fn from(value: BTreeMap<String, PayloadValue>) -> Self {
        PayloadValue::Map(value)
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PayloadValue::Null,
            serde_json::Value::Bool(b) => PayloadValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PayloadValue::Int(i),
                None => n.as_f64().map(PayloadValue::Float).unwrap_or(PayloadValue::Null),
            },
            serde_json::Value::String(s) => PayloadValue::String(s),
            serde_json::Value::Array(items) => {
                PayloadValue::List(items.into_iter().map(PayloadValue::from).collect())
            }
            serde_json::Value::Object(map) => PayloadValue::Map(
                map.into_iter().map(|(k, v)| (k, PayloadValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&PayloadValue> for serde_json::Value {
    fn from(value: &PayloadValue) -> Self {
        match value {
            PayloadValue::Null => serde_json::Value::Null,
            PayloadValue::Bool(b) => serde_json::Value::Bool(*b),
            PayloadValue::Int(i) => serde_json::Value::from(*i),
            // JSON has no NaN/Infinity
            PayloadValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PayloadValue::String(s) => serde_json::Value::String(s.clone()),
            PayloadValue::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            PayloadValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), serde_json::Value::from(v))).collect(),
            ),
        }
    }
}

/// Convert a payload into a JSON object for the request body
pub fn payload_to_json(payload: &Payload) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
            .collect(),
    )
}

// ============================================================================
// Connectivity
// ============================================================================

/// Backend reachability as published by the remote client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    pub authenticated: bool,
    pub connected: bool,
}

impl ConnectionState {
    pub fn online() -> Self {
        Self { authenticated: true, connected: true }
    }

    /// Both signed in and reachable
    pub fn is_online(&self) -> bool {
        self.authenticated && self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_raw_values() {
        for data_type in [
            DataType::Calendars,
            DataType::Assignments,
            DataType::Categories,
            DataType::Courses,
            DataType::Events,
            DataType::Schedules,
            DataType::ScheduleItems,
        ] {
            assert_eq!(data_type.as_str().parse::<DataType>(), Ok(data_type));
            let json = serde_json::to_string(&data_type).unwrap();
            assert_eq!(json, format!("\"{}\"", data_type.as_str()));
        }

        assert_eq!("tasks".parse::<DataType>(), Err(UnknownDataType("tasks".into())));
        assert!(DataType::ScheduleItems.is_legacy());
        assert!(!DataType::Events.is_legacy());
    }

    #[test]
    fn test_payload_value_json_shapes() {
        let mut nested = BTreeMap::new();
        nested.insert("done".to_string(), PayloadValue::Bool(true));

        let mut payload = Payload::new();
        payload.insert("id".into(), "evt-1".into());
        payload.insert("priority".into(), 3i64.into());
        payload.insert("weight".into(), 0.5.into());
        payload.insert("whole".into(), 2.0.into());
        payload.insert("notes".into(), PayloadValue::Null);
        payload.insert("tags".into(), vec![PayloadValue::from("a"), PayloadValue::from(1i64)].into());
        payload.insert("meta".into(), nested.into());

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""priority":3"#));
        assert!(json.contains(r#""whole":2.0"#));
        assert!(json.contains(r#""notes":null"#));

        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded["whole"], PayloadValue::Float(2.0));
        assert_eq!(decoded["priority"], PayloadValue::Int(3));
    }

    #[test]
    fn test_integers_beyond_i64_decode_as_float() {
        let decoded: Payload = serde_json::from_str(r#"{"small":9223372036854775807,"big":18446744073709551615}"#).unwrap();

        assert_eq!(decoded["small"], PayloadValue::Int(i64::MAX));
        assert_eq!(decoded["big"], PayloadValue::Float(18446744073709551615u64 as f64));

        let from_json = PayloadValue::from(serde_json::json!(u64::MAX));
        assert!(matches!(from_json, PayloadValue::Float(_)));
    }

    #[test]
    fn test_json_value_conversion() {
        let value = serde_json::json!({
            "title": "Midterm",
            "points": 40,
            "ratio": 0.25,
            "rooms": ["A1", null],
            "flags": { "graded": false }
        });

        let converted = PayloadValue::from(value.clone());
        assert_eq!(serde_json::Value::from(&converted), value);

        assert_eq!(
            serde_json::Value::from(&PayloadValue::Float(f64::NAN)),
            serde_json::Value::Null
        );
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::default().is_online());
        assert!(!ConnectionState { authenticated: true, connected: false }.is_online());
        assert!(ConnectionState::online().is_online());
    }
}

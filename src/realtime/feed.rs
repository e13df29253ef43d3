use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};

/// Logical channel name, e.g. `attendance:<session>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }
    pub fn attendance(session_id: &str) -> Self { Self(format!("attendance:{}", session_id)) }
    pub fn session_status(session_id: &str) -> Self { Self(format!("session:{}", session_id)) }
    pub fn course_sessions(course_id: &str) -> Self { Self(format!("course:{}", course_id)) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Row filter for a channel: every change on `table`, optionally narrowed to
/// rows whose `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self { Self { table: table.into(), column: None, value: None } }

    pub fn eq(table: impl Into<String>, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self { table: table.into(), column: Some(column.into()), value: Some(value.into()) }
    }

    pub fn matches(&self, table: &str, row: &JsonValue) -> bool {
        if self.table != table { return false; }
        let (Some(column), Some(value)) = (&self.column, &self.value) else { return true; };
        match row.get(column) {
            Some(JsonValue::String(s)) => s == value,
            Some(JsonValue::Null) | None => false,
            Some(other) => other.to_string() == *value,
        }
    }

    /// True if the event concerns a row this filter selects (new row, else old row).
    pub fn matches_event(&self, ev: &ChangeEvent) -> bool {
        [ev.new.as_ref(), ev.old.as_ref()].into_iter().flatten().any(|row| self.matches(&ev.table, row))
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.column, &self.value) {
            (Some(c), Some(v)) => write!(f, "{}:{}=eq.{}", self.table, c, v),
            _ => f.write_str(&self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row change as pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub new: Option<JsonValue>,
    #[serde(default)]
    pub old: Option<JsonValue>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: JsonValue) -> Self {
        Self { kind: ChangeKind::Insert, table: table.into(), new: Some(new), old: None }
    }

    pub fn update(table: impl Into<String>, new: JsonValue, old: Option<JsonValue>) -> Self {
        Self { kind: ChangeKind::Update, table: table.into(), new: Some(new), old }
    }

    pub fn delete(table: impl Into<String>, old: JsonValue) -> Self {
        Self { kind: ChangeKind::Delete, table: table.into(), new: None, old: Some(old) }
    }

    pub fn decode_new<T: DeserializeOwned>(&self) -> AppResult<T> { decode(self.new.as_ref(), "new") }
    pub fn decode_old<T: DeserializeOwned>(&self) -> AppResult<T> { decode(self.old.as_ref(), "old") }
}

fn decode<T: DeserializeOwned>(row: Option<&JsonValue>, which: &str) -> AppResult<T> {
    let row = row.ok_or_else(|| AppError::user("missing_payload".to_string(), format!("change event has no '{}' row", which)))?;
    serde_json::from_value(row.clone()).map_err(|e| AppError::user("bad_payload".to_string(), format!("'{}' row: {}", which, e)))
}

/// Lifecycle notices for an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Errored(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

pub type FeedReceiver = mpsc::UnboundedReceiver<FeedMessage>;

/// Backend change-feed primitive. A channel delivers status notices and
/// filtered row changes until it is closed; the stream ending means the
/// backend dropped the channel.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open_channel(&self, key: &ResourceKey, filter: &ChangeFilter) -> AppResult<(ChannelHandle, FeedReceiver)>;
    async fn close_channel(&self, handle: ChannelHandle) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_follow_channel_naming() {
        assert_eq!(ResourceKey::attendance("T").as_str(), "attendance:T");
        assert_eq!(ResourceKey::session_status("T").to_string(), "session:T");
        assert_eq!(ResourceKey::course_sessions("C9").as_str(), "course:C9");
    }

    #[test]
    fn filter_matches_by_column_value() {
        let f = ChangeFilter::eq("attendance", "session_id", "T");
        assert!(f.matches("attendance", &json!({"session_id": "T"})));
        assert!(!f.matches("attendance", &json!({"session_id": "U"})));
        assert!(!f.matches("sessions", &json!({"session_id": "T"})));
        assert!(!f.matches("attendance", &json!({"other": "T"})));
        assert_eq!(f.to_string(), "attendance:session_id=eq.T");

        let numeric = ChangeFilter::eq("sessions", "course_id", "42");
        assert!(numeric.matches("sessions", &json!({"course_id": 42})));
        assert!(ChangeFilter::table("sessions").matches("sessions", &json!({})));
    }

    #[test]
    fn delete_events_match_on_old_row() {
        let f = ChangeFilter::eq("attendance", "session_id", "T");
        let ev = ChangeEvent::delete("attendance", json!({"id": "a1", "session_id": "T"}));
        assert!(f.matches_event(&ev));
    }

    #[test]
    fn wire_shape_uses_event_type() {
        let ev: ChangeEvent = serde_json::from_value(json!({
            "eventType": "UPDATE", "table": "sessions", "new": {"session_id": "T"}
        }))
        .unwrap();
        assert_eq!(ev.kind, ChangeKind::Update);
        assert!(ev.old.is_none());
        assert_eq!(ev.decode_old::<JsonValue>().unwrap_err().code_str(), "missing_payload");
    }
}

//! Event frame types pushed to live clients
//!
//! Every frame delivered over the event stream, whether a domain event, a
//! handshake or a subscription confirmation, is an [`EventFrame`]. On the wire
//! it becomes one SSE record: `event: <type>\ndata: <json>\n\n`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic carrying mirror queue health
pub const MIRROR_TOPIC: &str = "mirror";

/// Topic carrying listener request activity
pub const REQUESTS_TOPIC: &str = "requests";

/// Topic carrying now-playing changes
pub const NOW_PLAYING_TOPIC: &str = "nowPlaying";

/// Topics a broadcaster knows about when none are configured
pub fn default_topics() -> Vec<String> {
    vec![
        MIRROR_TOPIC.to_string(),
        REQUESTS_TOPIC.to_string(),
        NOW_PLAYING_TOPIC.to_string(),
    ]
}

/// Frame type sent once when a client connects
pub const FRAME_CONNECTED: &str = "connected";

/// Frame type confirming newly added subscriptions
pub const FRAME_SUBSCRIBED: &str = "subscribed";

/// Frame type sent before the server closes a client
pub const FRAME_DISCONNECTED: &str = "disconnected";

/// One event delivered to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name, also used as the SSE `event:` field
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event body
    #[serde(default)]
    pub payload: Value,

    /// Topic the frame was broadcast on (None for addressed control frames)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// When the event happened; stamped at broadcast time if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventFrame {
    /// Create a frame without a timestamp
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            topic: None,
            timestamp: None,
        }
    }

    /// Create a frame stamped with the current time
    pub fn now(event_type: impl Into<String>, payload: Value) -> Self {
        Self::new(event_type, payload).with_timestamp(Utc::now())
    }

    /// Set an explicit timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamp the current time if no timestamp is present
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    /// Format as SSE protocol string
    pub fn to_sse_string(&self) -> String {
        let data_json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type, data_json)
    }
}

/// Mirror health event types as seen by dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncEventType {
    /// A command was accepted by the mirror queue
    SyncStarted,
    /// A command attempt began
    SyncProgress,
    /// A command was applied to the legacy store
    SyncComplete,
    /// A command attempt failed and will be retried
    SyncRetry,
    /// The mirror queue stopped permanently
    SyncError,
}

impl SyncEventType {
    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::SyncStarted => "syncStarted",
            SyncEventType::SyncProgress => "syncProgress",
            SyncEventType::SyncComplete => "syncComplete",
            SyncEventType::SyncRetry => "syncRetry",
            SyncEventType::SyncError => "syncError",
        }
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_serializes_type_field() {
        let frame = EventFrame::new("syncComplete", json!({"commandId": "abc"}));
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], "syncComplete");
        assert_eq!(value["payload"]["commandId"], "abc");
        assert!(value.get("timestamp").is_none());
        assert!(value.get("topic").is_none());
    }

    #[test]
    fn test_stamp_keeps_existing_timestamp() {
        let fixed = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut frame = EventFrame::new("x", Value::Null).with_timestamp(fixed);
        frame.stamp();
        assert_eq!(frame.timestamp, Some(fixed));

        let mut unstamped = EventFrame::new("x", Value::Null);
        unstamped.stamp();
        assert!(unstamped.timestamp.is_some());
    }

    #[test]
    fn test_sse_string_format() {
        let frame = EventFrame::new("connected", json!({"clientId": "c1"}));
        let sse = frame.to_sse_string();

        assert!(sse.starts_with("event: connected\ndata: {"));
        assert!(sse.ends_with("\n\n"));
        assert!(sse.contains("\"clientId\":\"c1\""));
    }

    #[test]
    fn test_sync_event_type_names_match_serde() {
        for kind in [
            SyncEventType::SyncStarted,
            SyncEventType::SyncProgress,
            SyncEventType::SyncComplete,
            SyncEventType::SyncRetry,
            SyncEventType::SyncError,
        ] {
            let serialized = serde_json::to_value(kind).unwrap();
            assert_eq!(serialized, kind.as_str());
        }
    }

    #[test]
    fn test_default_topics_include_mirror() {
        assert!(default_topics().iter().any(|t| t == MIRROR_TOPIC));
    }
}

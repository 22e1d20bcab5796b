// ── Event types ──
//
// `InboundEvent` is what the supervisor forwards from the transport,
// `DecodedEvent` is what the sinks see, and `SinkMessage` is the JSON
// shape written by the broker and log sinks.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Value of the `source` field on every outgoing message.
pub const EVENT_SOURCE: &str = "bms-realtime";

/// A bound application event as received on a channel, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub channel: String,
    pub event: String,
    /// Raw wire payload; `None` when the frame carried no data.
    pub payload: Option<String>,
}

/// A successfully decoded event. Delivered once, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_type: String,
    pub channel: String,
    pub data: Value,
    /// Ingestion time.
    pub timestamp: DateTime<Utc>,
}

impl DecodedEvent {
    pub fn new(event_type: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            channel: channel.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_message(&self) -> SinkMessage<'_> {
        SinkMessage {
            event_type: &self.event_type,
            channel: &self.channel,
            data: &self.data,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            source: EVENT_SOURCE,
        }
    }
}

/// Outgoing JSON record.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkMessage<'a> {
    pub event_type: &'a str,
    pub channel: &'a str,
    pub data: &'a Value,
    pub timestamp: String,
    pub source: &'static str,
}

//! Streaming protocol types
//!
//! Inbound frames are JSON envelopes `{type, entity_id?, timestamp?, data?}`
//! plus a couple of bare control strings. Everything is decoded once here so
//! consumers only ever see [`ServerMessage`] variants.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::models::{
    Alert, AggregateStats, AtmStatus, Readings, StatusChange, TelemetrySample, parse_timestamp,
    timestamp,
};

/// Heartbeat frame sent on every tick.
pub const PING: &str = "ping";
/// Heartbeat reply; dropped by the router.
pub const PONG: &str = "pong";
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
/// Asks the detail channel to resend its history.
pub const REQUEST_HISTORY: &str = "request_history";

/// One logical streaming feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Dashboard,
    /// Fleet list; shares the dashboard endpoint.
    AtmList,
    AtmDetail(String),
    Alerts,
}

impl Channel {
    /// Path segment under `/ws/`.
    pub fn path(&self) -> String {
        match self {
            Self::Dashboard | Self::AtmList => "dashboard".to_string(),
            Self::AtmDetail(id) => format!("atm/{id}"),
            Self::Alerts => "alerts".to_string(),
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> String {
        match self {
            Self::Dashboard => "dashboard".to_string(),
            Self::AtmList => "atm_list".to_string(),
            Self::AtmDetail(id) => format!("atm:{id}"),
            Self::Alerts => "alerts".to_string(),
        }
    }

    /// Derive the socket URL from the HTTP(S) API origin.
    pub fn ws_url(&self, base_url: &str, api_prefix: &str) -> Result<String, SyncError> {
        let (scheme, rest) = if let Some(rest) = base_url.strip_prefix("https://") {
            ("wss://", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            ("ws://", rest)
        } else {
            return Err(SyncError::InvalidUrl(base_url.to_string()));
        };
        let host = rest.trim_end_matches('/');
        if host.is_empty() {
            return Err(SyncError::InvalidUrl(base_url.to_string()));
        }
        let prefix = api_prefix.trim_matches('/');
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("/{prefix}")
        };
        Ok(format!("{scheme}{host}{prefix}/ws/{}", self.path()))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Envelope as it arrives on the wire, before the payload is typed.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default, alias = "atm_id")]
    entity_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Recognized envelope tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ConnectionEstablished,
    AtmInitial,
    DashboardInitial,
    AlertsInitial,
    TelemetryUpdate,
    StatusChange,
    NewAlert,
    AlertUpdated,
    AlertResolved,
    HistoryRequested,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "connection_established" => Self::ConnectionEstablished,
            "atm_initial" => Self::AtmInitial,
            "dashboard_initial" => Self::DashboardInitial,
            "alerts_initial" => Self::AlertsInitial,
            "telemetry_update" => Self::TelemetryUpdate,
            "status_change" | "atm_status_change" => Self::StatusChange,
            "new_alert" => Self::NewAlert,
            "alert_updated" => Self::AlertUpdated,
            "alert_resolved" => Self::AlertResolved,
            "history_requested" => Self::HistoryRequested,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::AtmInitial => "atm_initial",
            Self::DashboardInitial => "dashboard_initial",
            Self::AlertsInitial => "alerts_initial",
            Self::TelemetryUpdate => "telemetry_update",
            Self::StatusChange => "status_change",
            Self::NewAlert => "new_alert",
            Self::AlertUpdated => "alert_updated",
            Self::AlertResolved => "alert_resolved",
            Self::HistoryRequested => "history_requested",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Full hydration of the detail channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailHydration {
    #[serde(default)]
    pub latest_telemetry: Option<TelemetrySample>,
    #[serde(default)]
    pub telemetry_history: Option<Vec<TelemetrySample>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardHydration {
    #[serde(default)]
    pub stats: Option<AggregateStats>,
    #[serde(default)]
    pub alerts: Option<Vec<Alert>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertsHydration {
    #[serde(default)]
    pub alerts: Option<Vec<Alert>>,
}

/// Identifies the alert an `alert_resolved` refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRef {
    #[serde(alias = "alert_id")]
    pub id: String,
    #[serde(default, alias = "type")]
    pub title: Option<String>,
    #[serde(default)]
    pub atm_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelemetryPayload {
    #[serde(default)]
    atm_id: Option<String>,
    #[serde(default, alias = "time", deserialize_with = "timestamp::optional")]
    timestamp: Option<DateTime<Utc>>,
    status: AtmStatus,
    #[serde(flatten)]
    readings: Readings,
}

#[derive(Debug, Deserialize)]
struct StatusChangePayload {
    #[serde(default)]
    atm_id: Option<String>,
    old_status: AtmStatus,
    new_status: AtmStatus,
    #[serde(default, deserialize_with = "timestamp::optional")]
    timestamp: Option<DateTime<Utc>>,
}

/// Typed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionEstablished,
    AtmInitial(DetailHydration),
    DashboardInitial(DashboardHydration),
    AlertsInitial(AlertsHydration),
    TelemetryUpdate(TelemetrySample),
    StatusChange(StatusChange),
    NewAlert(Alert),
    AlertUpdated(Alert),
    AlertResolved(AlertRef),
    HistoryRequested,
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConnectionEstablished => MessageKind::ConnectionEstablished,
            Self::AtmInitial(_) => MessageKind::AtmInitial,
            Self::DashboardInitial(_) => MessageKind::DashboardInitial,
            Self::AlertsInitial(_) => MessageKind::AlertsInitial,
            Self::TelemetryUpdate(_) => MessageKind::TelemetryUpdate,
            Self::StatusChange(_) => MessageKind::StatusChange,
            Self::NewAlert(_) => MessageKind::NewAlert,
            Self::AlertUpdated(_) => MessageKind::AlertUpdated,
            Self::AlertResolved(_) => MessageKind::AlertResolved,
            Self::HistoryRequested => MessageKind::HistoryRequested,
        }
    }

    fn decode(
        kind: MessageKind,
        entity_id: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
        data: Option<Value>,
    ) -> Result<Self, SyncError> {
        Ok(match kind {
            MessageKind::ConnectionEstablished => Self::ConnectionEstablished,
            MessageKind::HistoryRequested => Self::HistoryRequested,
            MessageKind::AtmInitial => Self::AtmInitial(hydration(data)?),
            MessageKind::DashboardInitial => Self::DashboardInitial(hydration(data)?),
            MessageKind::AlertsInitial => Self::AlertsInitial(hydration(data)?),
            MessageKind::TelemetryUpdate => {
                let payload: TelemetryPayload = required(kind, data)?;
                let atm_id = payload
                    .atm_id
                    .or_else(|| entity_id.map(str::to_string))
                    .ok_or_else(|| SyncError::Decode("telemetry_update without atm_id".into()))?;
                Self::TelemetryUpdate(TelemetrySample {
                    time: payload.timestamp.or(sent_at).unwrap_or_else(Utc::now),
                    atm_id,
                    status: payload.status,
                    readings: payload.readings,
                })
            }
            MessageKind::StatusChange => {
                let payload: StatusChangePayload = required(kind, data)?;
                let atm_id = payload
                    .atm_id
                    .or_else(|| entity_id.map(str::to_string))
                    .ok_or_else(|| SyncError::Decode("status_change without atm_id".into()))?;
                Self::StatusChange(StatusChange {
                    atm_id,
                    old_status: payload.old_status,
                    new_status: payload.new_status,
                    timestamp: payload.timestamp.or(sent_at).unwrap_or_else(Utc::now),
                })
            }
            MessageKind::NewAlert => Self::NewAlert(required(kind, data)?),
            MessageKind::AlertUpdated => Self::AlertUpdated(required(kind, data)?),
            MessageKind::AlertResolved => Self::AlertResolved(required(kind, data)?),
        })
    }
}

fn required<T: DeserializeOwned>(kind: MessageKind, data: Option<Value>) -> Result<T, SyncError> {
    match data {
        Some(Value::Null) | None => Err(SyncError::Decode(format!("{kind} without data"))),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

/// Hydration payloads treat a missing body as empty.
fn hydration<T: DeserializeOwned + Default>(data: Option<Value>) -> Result<T, SyncError> {
    match data {
        Some(Value::Null) | None => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

/// A decoded message with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub message: ServerMessage,
    pub entity_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Inbound {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            entity_id: None,
            timestamp: None,
        }
    }

    /// The ATM this message is about, taken from the payload first.
    pub fn subject(&self) -> Option<&str> {
        match &self.message {
            ServerMessage::TelemetryUpdate(sample) => Some(&sample.atm_id),
            ServerMessage::StatusChange(change) => Some(&change.atm_id),
            ServerMessage::NewAlert(alert) | ServerMessage::AlertUpdated(alert) => {
                alert.atm_id.as_deref().or(self.entity_id.as_deref())
            }
            _ => self.entity_id.as_deref(),
        }
    }
}

/// Result of decoding one text frame.
#[derive(Debug)]
pub enum Frame {
    Heartbeat,
    Message(Inbound),
    Unknown { tag: String },
    Malformed(SyncError),
}

fn is_heartbeat(s: &str) -> bool {
    s == PONG || s == HEARTBEAT_ACK
}

pub fn decode_frame(text: &str) -> Frame {
    let text = text.trim();
    if is_heartbeat(text) {
        return Frame::Heartbeat;
    }
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Frame::Malformed(e.into()),
    };
    if let Value::String(s) = &value {
        if is_heartbeat(s) {
            return Frame::Heartbeat;
        }
    }
    let raw: RawEnvelope = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => return Frame::Malformed(e.into()),
    };
    if is_heartbeat(&raw.tag) {
        return Frame::Heartbeat;
    }
    let Some(kind) = MessageKind::from_tag(&raw.tag) else {
        return Frame::Unknown { tag: raw.tag };
    };
    let sent_at = raw.timestamp.as_deref().and_then(parse_timestamp);
    match ServerMessage::decode(kind, raw.entity_id.as_deref(), sent_at, raw.data) {
        Ok(message) => Frame::Message(Inbound {
            message,
            entity_id: raw.entity_id,
            timestamp: sent_at,
        }),
        Err(e) => Frame::Malformed(e),
    }
}

//! Inbound event frames and the payloads the console knows about
//!
//! The canonical frame shape is `{"eventType": ..., "payload": ...}`. The
//! console's event source broadcasts `{"type": ..., "data": ...}`; both are
//! accepted.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Event type names used by the console. The dispatcher treats every type
/// name as an opaque string, these are only here for subscribers.
pub mod event_types {
    pub const FACE_DETECTION: &str = "face_detection";
    pub const VEHICLE_DETECTION: &str = "vehicle_detection";
    pub const INTRUSION: &str = "intrusion";
    pub const OBJECT_DETECTION: &str = "object_detection";
    pub const EVENT: &str = "event";
    pub const ALERT: &str = "alert";
    pub const CAMERA_STATUS: &str = "camera_status";

    /// keep-alive request sent by the client
    pub const PING: &str = "ping";
    /// keep-alive reply, never dispatched
    pub const PONG: &str = "pong";
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotObject,

    #[error("frame has an empty eventType")]
    EmptyType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "eventType", alias = "type")]
    pub event_type: String,
    #[serde(alias = "data", default)]
    pub payload: Value,
}

impl EventFrame {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(FrameError::NotObject);
        }
        let frame: EventFrame = serde_json::from_value(value)?;
        if frame.event_type.is_empty() {
            return Err(FrameError::EmptyType);
        }
        Ok(frame)
    }

    /// Control frames refresh liveness but are not delivered to subscribers
    pub fn is_control(&self) -> bool {
        self.event_type == event_types::PONG
    }
}

pub fn ping_message() -> String {
    serde_json::json!({ "type": event_types::PING }).to_string()
}

/// Payload of `event` frames, one detection row as the event log shows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveillanceEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub description: String,
    pub camera_id: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    /// ISO 8601 with an offset; a timestamp without one is taken as UTC
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(timestamp) => Ok(timestamp.with_timezone(&Utc)),
        Err(_) => raw.parse::<NaiveDateTime>().map(|naive| naive.and_utc()),
    }
}

/// Payload of `camera_status` frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CameraStatusUpdate {
    Created { camera: CameraSummary },
    Updated { camera: CameraSummary },
    Deleted { camera_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl CameraStatusUpdate {
    pub fn camera_id(&self) -> &str {
        match self {
            CameraStatusUpdate::Created { camera } | CameraStatusUpdate::Updated { camera } => &camera.id,
            CameraStatusUpdate::Deleted { camera_id } => camera_id,
        }
    }
}

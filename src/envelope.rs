//! Wire envelope for the dashboard event stream.
//!
//! Every frame on the streaming socket is a JSON object discriminated by its
//! `type` field:
//!
//! ```json
//! {"type":"log","level":"info","operation":"handleTestSudo",
//!  "timestamp":1754995900283,"message":"Sudo access not available"}
//! ```
//!
//! [`Envelope`] is the parsed, immutable form of such a frame. Client-to-server
//! control frames (`start_logs` / `stop_logs`) use the same shape and are built
//! from [`ControlMessage`].

// Rust guideline compliant 2026-02

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Severity of an envelope or log entry.
///
/// Unknown, missing or non-string levels decode as [`Level::Info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Informational (default).
    #[default]
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
    /// Debug detail.
    Debug,
}

impl Level {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }

    /// Parse a wire name, case-insensitively. `warning` is accepted as `warn`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw).unwrap_or_default())
    }
}

/// Envelope discriminant (the `type` field).
///
/// The four kinds the dashboard produces get their own variants so the
/// normalizer can match them exhaustively; anything else is carried verbatim
/// in [`EventKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Structured backend log line (`log`).
    Log,
    /// Container log line for the dedicated viewer (`logs`).
    Logs,
    /// System notice (`system`).
    System,
    /// Installation progress (`installation`).
    Installation,
    /// Application-defined discriminant, including client control frames.
    Custom(String),
}

impl EventKind {
    /// Wire name of this discriminant.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Log => "log",
            Self::Logs => "logs",
            Self::System => "system",
            Self::Installation => "installation",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "log" => Self::Log,
            "logs" => Self::Logs,
            "system" => Self::System,
            "installation" => Self::Installation,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "log" | "logs" | "system" | "installation" => Self::from(s.as_str()),
            _ => Self::Custom(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer-supplied timestamp.
///
/// Backend `log` frames carry epoch milliseconds; container `logs` frames
/// already carry an ISO-8601 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// Fractional milliseconds (truncated on conversion).
    Fractional(f64),
    /// Preformatted timestamp string.
    Text(String),
}

/// Decode an optional field, reading a value of the wrong shape as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).ok())
}

/// One frame of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Discriminant used for routing.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Producer timestamp, if any.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Severity, if any.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
    /// Free-text origin tag (e.g. the backend handler name).
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Message body. Usually a string, sometimes a structured payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub message: serde_json::Value,
    /// Structured payload (control frames, container log metadata).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    /// Create an envelope with a text message and no optional fields.
    #[must_use]
    pub fn new(kind: impl Into<EventKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: None,
            level: None,
            operation: None,
            message: serde_json::Value::String(message.into()),
            data: None,
        }
    }

    /// Set the severity.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Set the origin tag.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set an epoch-milliseconds timestamp.
    pub fn with_timestamp_millis(mut self, millis: i64) -> Self {
        self.timestamp = Some(Timestamp::Millis(millis));
        self
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON or has no string `type`.
    pub fn parse(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).context("malformed stream frame")
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize envelope")
    }

    /// Severity with the `info` default applied.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level.unwrap_or_default()
    }

    /// Message rendered as text.
    ///
    /// Strings are returned as-is, a missing message is empty, and any other
    /// JSON value is rendered as compact JSON.
    #[must_use]
    pub fn message_text(&self) -> String {
        match &self.message {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// `data.containerId`, if present.
    #[must_use]
    pub fn container_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("containerId"))
            .and_then(serde_json::Value::as_str)
    }
}

/// Client-to-server control frame.
///
/// Sent fire-and-forget; the server never acknowledges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Begin streaming logs for a container.
    StartLogs {
        /// Container to stream.
        container_id: String,
    },
    /// Stop streaming logs for a container.
    StopLogs {
        /// Container to stop.
        container_id: String,
    },
}

impl ControlMessage {
    /// Wire discriminant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartLogs { .. } => "start_logs",
            Self::StopLogs { .. } => "stop_logs",
        }
    }

    /// Build the envelope sent on the wire.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        let (Self::StartLogs { container_id } | Self::StopLogs { container_id }) = self;
        Envelope {
            kind: EventKind::Custom(self.kind().to_string()),
            timestamp: None,
            level: None,
            operation: None,
            message: serde_json::Value::Null,
            data: Some(serde_json::json!({ "containerId": container_id })),
        }
    }
}

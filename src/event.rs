//! Normalized events delivered to subscribers.
//!
//! The router turns each [`Envelope`] into an [`Event`] exactly once, at
//! dispatch time. Log-shaped discriminants become a ready-to-display
//! [`LogEntry`]; everything else is handed over as the immutable envelope and
//! rendered by the consumer that asked for it.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EventKind, Level, Timestamp};

/// Consumer-facing log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Display text.
    pub message: String,
    /// ISO-8601 timestamp, e.g. `2023-11-14T22:13:20.000Z`.
    pub timestamp: String,
    /// Severity.
    pub level: Level,
    /// Origin tag, if the producer supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Container the line belongs to (viewer frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with `at`.
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            timestamp: iso_timestamp(at),
            level,
            operation: None,
            container_id: None,
        }
    }

    /// Attach an origin tag.
    pub fn with_operation(mut self, operation: Option<String>) -> Self {
        self.operation = operation;
        self
    }
}

/// A routed, normalized envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `log` or `logs` frame, already normalized.
    Log(LogEntry),
    /// `system` notice.
    System(Arc<Envelope>),
    /// `installation` progress update.
    Installation(Arc<Envelope>),
    /// Any other discriminant.
    Custom(Arc<Envelope>),
}

impl Event {
    /// Normalize an envelope. `received_at` stands in for a missing or
    /// unrepresentable producer timestamp.
    #[must_use]
    pub fn normalize(envelope: Envelope, received_at: DateTime<Utc>) -> Self {
        match envelope.kind {
            EventKind::Log | EventKind::Logs => Self::Log(log_entry(&envelope, received_at)),
            EventKind::System => Self::System(Arc::new(envelope)),
            EventKind::Installation => Self::Installation(Arc::new(envelope)),
            EventKind::Custom(_) => Self::Custom(Arc::new(envelope)),
        }
    }

    /// The normalized log entry, for `log`/`logs` events.
    #[must_use]
    pub fn as_log(&self) -> Option<&LogEntry> {
        match self {
            Self::Log(entry) => Some(entry),
            _ => None,
        }
    }

    /// The source envelope, for non-log events.
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Log(_) => None,
            Self::System(env) | Self::Installation(env) | Self::Custom(env) => Some(env),
        }
    }
}

fn log_entry(envelope: &Envelope, received_at: DateTime<Utc>) -> LogEntry {
    let timestamp = match &envelope.timestamp {
        Some(Timestamp::Millis(ms)) => millis_to_iso(*ms),
        Some(Timestamp::Fractional(ms)) => millis_to_iso(ms.trunc() as i64),
        Some(Timestamp::Text(text)) => Some(text.clone()),
        None => None,
    }
    .unwrap_or_else(|| iso_timestamp(received_at));

    LogEntry {
        message: envelope.message_text(),
        timestamp,
        level: envelope.level(),
        operation: envelope.operation.clone(),
        container_id: envelope.container_id().map(str::to_string),
    }
}

/// Format a UTC instant as ISO-8601 with millisecond precision and `Z`.
#[must_use]
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert epoch milliseconds to ISO-8601. `None` if out of range.
#[must_use]
pub fn millis_to_iso(millis: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(iso_timestamp)
}

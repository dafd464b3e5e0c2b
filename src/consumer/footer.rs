//! Footer panel: a short rolling log of backend activity.
//!
//! Shows `log` lines, `system` notices, and `installation` progress in one
//! buffer (default capacity 100), plus a line whenever the connection comes up
//! or fails.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::{EntryHook, EntrySink};
use crate::connection::{ConnectionState, StateChange, StreamConnection};
use crate::envelope::{Envelope, EventKind, Level};
use crate::event::{Event, LogEntry};
use crate::router::Subscription;

/// Line appended when the connection opens.
pub const CONNECTED_MESSAGE: &str = "WebSocket connected successfully";

/// Line appended when a connection attempt fails, followed by `: <reason>`
/// when the reason is known.
pub const FAILED_MESSAGE: &str = "WebSocket connection failed";

/// Mounted footer panel. Dropping it unmounts.
pub struct FooterPanel {
    conn: StreamConnection,
    sink: EntrySink,
    _subscriptions: Vec<Subscription>,
    status_task: JoinHandle<()>,
}

impl std::fmt::Debug for FooterPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FooterPanel")
            .field("status", &self.conn.state())
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl FooterPanel {
    /// Mount with a buffer of `capacity` entries.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn mount(conn: &StreamConnection, capacity: usize) -> Self {
        Self::mount_with_hook(conn, capacity, None)
    }

    /// Mount and call `hook` for every appended entry.
    #[must_use]
    pub fn mount_with_hook(
        conn: &StreamConnection,
        capacity: usize,
        hook: Option<EntryHook>,
    ) -> Self {
        let sink = EntrySink::new(capacity, hook);

        let subscriptions = vec![
            conn.on(EventKind::System, {
                let sink = sink.clone();
                move |event: &Event| {
                    if let Some(envelope) = event.envelope() {
                        sink.append(system_entry(envelope, Utc::now())?);
                    }
                    Ok(())
                }
            }),
            conn.on(EventKind::Log, {
                let sink = sink.clone();
                move |event: &Event| {
                    if let Some(entry) = event.as_log() {
                        sink.append(entry.clone());
                    }
                    Ok(())
                }
            }),
            conn.on(EventKind::Installation, {
                let sink = sink.clone();
                move |event: &Event| {
                    if let Some(envelope) = event.envelope() {
                        sink.append(installation_entry(envelope, Utc::now())?);
                    }
                    Ok(())
                }
            }),
        ];

        // Subscribe before initiating so the first transition is observed.
        let status_task = tokio::spawn(watch_status(conn.state_changes(), sink.clone()));
        conn.ensure_connected();

        Self {
            conn: conn.clone(),
            sink,
            _subscriptions: subscriptions,
            status_task,
        }
    }

    /// Connection state for the status indicator.
    #[must_use]
    pub fn status(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Buffered entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.sink.lock().to_vec()
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sink.lock().len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sink.lock().is_empty()
    }

    /// Empty the buffer. The connection is untouched.
    pub fn clear(&self) {
        self.sink.lock().clear();
    }

    /// User-triggered reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the new connection attempt fails.
    pub async fn reconnect(&self) -> Result<()> {
        self.conn.reconnect().await
    }
}

impl Drop for FooterPanel {
    fn drop(&mut self) {
        self.status_task.abort();
    }
}

/// Append a status line each time the connection enters `Connected` or
/// `Error`.
async fn watch_status(mut changes: broadcast::Receiver<StateChange>, sink: EntrySink) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                if let Some(entry) = status_entry(&change, Utc::now()) {
                    sink.append(entry);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("[Footer] Missed {} connection state changes", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Footer line for a state transition, if it gets one.
#[must_use]
pub fn status_entry(change: &StateChange, at: DateTime<Utc>) -> Option<LogEntry> {
    match change.state {
        ConnectionState::Connected => Some(LogEntry::new(Level::Info, CONNECTED_MESSAGE, at)),
        ConnectionState::Error => {
            let message = match &change.error {
                Some(reason) => format!("{FAILED_MESSAGE}: {reason}"),
                None => FAILED_MESSAGE.to_string(),
            };
            Some(LogEntry::new(Level::Error, message, at))
        }
        ConnectionState::Connecting | ConnectionState::Disconnected => None,
    }
}

/// Footer rendering of a `system` notice: the whole frame as JSON, stamped
/// with receipt time.
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn system_entry(envelope: &Envelope, received_at: DateTime<Utc>) -> Result<LogEntry> {
    Ok(LogEntry::new(Level::Info, envelope.to_json()?, received_at)
        .with_operation(envelope.operation.clone()))
}

/// Footer rendering of an `installation` update.
///
/// # Errors
///
/// Returns an error if the message is empty and the envelope cannot be
/// serialized.
pub fn installation_entry(envelope: &Envelope, received_at: DateTime<Utc>) -> Result<LogEntry> {
    let text = envelope.message_text();
    let body = if text.is_empty() { envelope.to_json()? } else { text };
    Ok(
        LogEntry::new(envelope.level(), format!("Installation: {body}"), received_at)
            .with_operation(envelope.operation.clone()),
    )
}

//! Container log viewer.
//!
//! Streams `logs` frames for one selected container into a buffer of
//! `max_lines` entries. Streaming is started and stopped with `start_logs` /
//! `stop_logs` control frames; the server never acknowledges them.

use chrono::NaiveDate;

use super::{EntryHook, EntrySink};
use crate::connection::StreamConnection;
use crate::envelope::{ControlMessage, EventKind};
use crate::event::{Event, LogEntry};
use crate::log_buffer::clamp_viewer_capacity;
use crate::router::Subscription;

/// Mounted log viewer. Dropping it unmounts.
pub struct LogViewer {
    conn: StreamConnection,
    sink: EntrySink,
    selected: Option<String>,
    streaming: bool,
    _subscription: Subscription,
}

impl std::fmt::Debug for LogViewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogViewer")
            .field("selected", &self.selected)
            .field("streaming", &self.streaming)
            .field("max_lines", &self.max_lines())
            .finish_non_exhaustive()
    }
}

impl LogViewer {
    /// Mount with room for `max_lines` entries (clamped to 100..=10000; zero
    /// means the default of 1000).
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn mount(conn: &StreamConnection, max_lines: usize) -> Self {
        Self::mount_with_hook(conn, max_lines, None)
    }

    /// Mount and call `hook` for every appended entry.
    #[must_use]
    pub fn mount_with_hook(
        conn: &StreamConnection,
        max_lines: usize,
        hook: Option<EntryHook>,
    ) -> Self {
        let sink = EntrySink::new(clamp_viewer_capacity(max_lines), hook);
        let subscription = conn.on(EventKind::Logs, {
            let sink = sink.clone();
            move |event: &Event| {
                if let Some(entry) = event.as_log() {
                    sink.append(entry.clone());
                }
                Ok(())
            }
        });
        conn.ensure_connected();

        Self {
            conn: conn.clone(),
            sink,
            selected: None,
            streaming: false,
            _subscription: subscription,
        }
    }

    /// Select `container_id` and ask the server to stream its logs.
    ///
    /// Clears the buffer first. Returns `false` if the id is empty or the
    /// request could not be sent (not connected).
    pub fn start_streaming(&mut self, container_id: &str) -> bool {
        if container_id.is_empty() {
            log::warn!("[Viewer] No container selected");
            return false;
        }
        self.sink.lock().clear();
        self.selected = Some(container_id.to_string());
        self.streaming = true;
        log::info!("[Viewer] Streaming logs for {}", container_id);
        self.conn.send_control(&ControlMessage::StartLogs {
            container_id: container_id.to_string(),
        })
    }

    /// Ask the server to stop streaming the selected container.
    ///
    /// Buffered entries are kept. Returns `false` if nothing is selected or
    /// the request could not be sent.
    pub fn stop_streaming(&mut self) -> bool {
        self.streaming = false;
        let Some(container_id) = self.selected.clone() else {
            return false;
        };
        log::info!("[Viewer] Stopped streaming logs for {}", container_id);
        self.conn
            .send_control(&ControlMessage::StopLogs { container_id })
    }

    /// Change the buffer size (clamped like [`Self::mount`]). Shrinking drops
    /// the oldest entries.
    pub fn set_max_lines(&self, max_lines: usize) {
        self.sink.lock().set_capacity(clamp_viewer_capacity(max_lines));
    }

    /// Current buffer size.
    #[must_use]
    pub fn max_lines(&self) -> usize {
        self.sink.lock().capacity()
    }

    /// Entries whose message contains `term` (case-insensitive).
    #[must_use]
    pub fn search(&self, term: &str) -> Vec<LogEntry> {
        self.sink.lock().filtered(term).into_iter().cloned().collect()
    }

    /// Buffered entries as downloadable text.
    #[must_use]
    pub fn export_text(&self) -> String {
        self.sink.lock().export_text()
    }

    /// File name for an export made on `date`.
    #[must_use]
    pub fn export_file_name(&self, date: NaiveDate) -> String {
        format!(
            "{}-logs-{}.txt",
            self.selected.as_deref().unwrap_or("docker"),
            date.format("%Y-%m-%d")
        )
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

    /// Empty the buffer.
    pub fn clear(&self) {
        self.sink.lock().clear();
    }

    /// True between `start_streaming` and `stop_streaming`.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Selected container, if any.
    #[must_use]
    pub fn selected_container(&self) -> Option<&str> {
        self.selected.as_deref()
    }
}

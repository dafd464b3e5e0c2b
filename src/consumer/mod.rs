//! Stream consumers.
//!
//! A consumer mounts against a [`StreamConnection`](crate::StreamConnection),
//! subscribes to the discriminants it renders, and keeps the most recent
//! entries in its own [`LogBuffer`]. Unmounting is dropping: the consumer's
//! [`Subscription`](crate::Subscription)s unsubscribe and any background
//! watcher is aborted.
//!
//! ```text
//!   StreamConnection ── Router ──┬── "system" / "log" / "installation" ──► FooterPanel
//!                                └── "logs" ─────────────────────────────► LogViewer
//! ```

pub mod footer;
pub mod viewer;

pub use footer::FooterPanel;
pub use viewer::LogViewer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::event::LogEntry;
use crate::log_buffer::LogBuffer;

/// Called with each entry after it lands in a consumer's buffer.
///
/// Runs on the connection task; keep it fast.
pub type EntryHook = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Buffer shared between a consumer and its subscription callbacks.
#[derive(Clone)]
pub(crate) struct EntrySink {
    buffer: Arc<Mutex<LogBuffer>>,
    hook: Option<EntryHook>,
}

impl EntrySink {
    pub(crate) fn new(capacity: usize, hook: Option<EntryHook>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(capacity.max(1)))),
            hook,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append, then notify the hook outside the buffer lock.
    pub(crate) fn append(&self, entry: LogEntry) {
        match &self.hook {
            Some(hook) => {
                self.lock().push(entry.clone());
                hook(&entry);
            }
            None => self.lock().push(entry),
        }
    }
}

//! Fixed-capacity log buffer with keep-last-N eviction.
//!
//! When the buffer is full, pushing a new entry silently evicts the oldest
//! entry from the front. Memory usage is bounded at `capacity` entries
//! regardless of how fast the backend streams log lines.
//!
//! # Usage by consumers
//!
//! Each mounted consumer owns one `LogBuffer`. Its subscription callback
//! appends normalized entries via [`LogBuffer::push`]; the view reads them
//! back oldest-first with [`LogBuffer::iter`] or [`LogBuffer::to_vec`]. The
//! buffer is dropped with the consumer.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

use crate::event::LogEntry;

/// Footer panel capacity.
pub const DEFAULT_FOOTER_CAPACITY: usize = 100;

/// Default log viewer capacity ("Max Lines").
pub const DEFAULT_VIEWER_CAPACITY: usize = 1000;

/// Smallest capacity the log viewer accepts.
pub const MIN_VIEWER_CAPACITY: usize = 100;

/// Largest capacity the log viewer accepts.
pub const MAX_VIEWER_CAPACITY: usize = 10_000;

/// Fixed-capacity ring of log entries.
///
/// Pushing more than `capacity` entries drops the oldest ones. Insertion
/// order is display order; entries are never re-sorted by timestamp.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    buf: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    /// Create a new buffer holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LogBuffer capacity must be > 0");
        Self {
            // VecDeque grows lazily up to the cap.
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest if the buffer is full.
    pub fn push(&mut self, entry: LogEntry) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(entry);
    }

    /// Append several entries in order.
    pub fn extend<I: IntoIterator<Item = LogEntry>>(&mut self, entries: I) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Change the capacity, dropping the oldest entries if it shrinks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn set_capacity(&mut self, capacity: usize) {
        assert!(capacity > 0, "LogBuffer capacity must be > 0");
        self.capacity = capacity;
        if self.buf.len() > capacity {
            let excess = self.buf.len() - capacity;
            self.buf.drain(..excess);
        }
    }

    /// Iterate entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.buf.iter()
    }

    /// Copy all entries, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<LogEntry> {
        self.buf.iter().cloned().collect()
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&LogEntry> {
        self.buf.back()
    }

    /// Entries whose message contains `term`, case-insensitively.
    ///
    /// An empty term matches everything.
    #[must_use]
    pub fn filtered(&self, term: &str) -> Vec<&LogEntry> {
        let needle = term.to_lowercase();
        self.buf
            .iter()
            .filter(|e| e.message.to_lowercase().contains(&needle))
            .collect()
    }

    /// Render as plain text, one `[timestamp] LEVEL: message` line per entry.
    #[must_use]
    pub fn export_text(&self) -> String {
        self.buf
            .iter()
            .map(|e| {
                format!(
                    "[{}] {}: {}",
                    e.timestamp,
                    e.level.as_str().to_uppercase(),
                    e.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if no entries are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all entries without changing capacity.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Configured maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<'a> IntoIterator for &'a LogBuffer {
    type Item = &'a LogEntry;
    type IntoIter = std::collections::vec_deque::Iter<'a, LogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.buf.iter()
    }
}

/// Clamp a requested viewer capacity into the accepted range.
///
/// Zero means "unset" and falls back to [`DEFAULT_VIEWER_CAPACITY`].
#[must_use]
pub fn clamp_viewer_capacity(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_VIEWER_CAPACITY
    } else {
        requested.clamp(MIN_VIEWER_CAPACITY, MAX_VIEWER_CAPACITY)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

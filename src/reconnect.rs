//! Reconnection policy and scheduling.
//!
//! The connection task asks [`Backoff`] for the delay before each retry and
//! waits it out on a [`Scheduler`]. The wait is always raced against the
//! session's cancellation token, so an explicit disconnect or a manual
//! reconnect cancels a pending retry.
//!
//! Delay before attempt *k* (1-indexed) is `base_delay * k`. The counter
//! resets whenever a socket opens; after `max_attempts` consecutive failures
//! the controller gives up for good.

// Rust guideline compliant 2026-02

use std::time::Duration;

use async_trait::async_trait;

/// Default base delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Default reconnection attempt ceiling.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 1000;

/// Retry limits for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay unit; attempt *k* waits `base_delay * k`.
    pub base_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Linear backoff counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh counter.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Claim the next attempt and return the delay to wait before it.
    ///
    /// Returns `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.base_delay.saturating_mul(self.attempts))
    }

    /// Forget past failures (called when a socket opens).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts claimed since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// True once no attempts remain.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }
}

/// Timer used for reconnection delays.
///
/// Injected so tests can observe the schedule without waiting in real time.
#[async_trait]
pub trait Scheduler: Send + Sync + std::fmt::Debug {
    /// Resolve after `delay`. Cancellation is handled by the caller dropping
    /// the returned future.
    async fn sleep(&self, delay: Duration);
}

/// [`Scheduler`] backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

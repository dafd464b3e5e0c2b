//! Stream connection service.
//!
//! One [`StreamConnection`] owns the single live socket to the streaming
//! endpoint, feeds inbound text frames to the shared [`Router`], and retries
//! with linear backoff when the socket drops.
//!
//! # Architecture
//!
//! ```text
//!   StreamConnection (Clone handle)          Session task
//!         │                                      │
//!         │  connect() ─── spawn ──────────────► │  open ─► message loop
//!         │                                      │    ▲          │
//!         │  send(envelope) ── outgoing queue ─► │    │   close / error
//!         │                                      │    │          ▼
//!         │  disconnect() ── cancel token ─────► │  Backoff ─► Scheduler::sleep
//!         │                                      │
//!         ▼                                      ▼
//!   watch<ConnectionState>               Router::dispatch_frame
//! ```
//!
//! Every transition is also published, in order, on a broadcast channel
//! ([`StreamConnection::state_changes`]) together with the failure text when
//! an attempt fails; `connect()` waiters and the footer read that stream.
//!
//! Each `connect()` that finds no live session starts a new one with a fresh
//! id. The task only updates the shared state while its id is still the live
//! session, so a cancelled task can never overwrite the state of its
//! successor.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::envelope::{ControlMessage, Envelope, EventKind};
use crate::event::Event;
use crate::reconnect::{Backoff, ReconnectPolicy, Scheduler, TokioScheduler};
use crate::router::{Callback, Router, Subscription};
use crate::transport::{FrameSink, FrameStream, Transport, WsTransport};
use crate::ws::WsMessage;

/// Lifecycle state of the stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; nothing will happen until `connect()`.
    #[default]
    Disconnected,
    /// Opening a socket (first attempt or a retry).
    Connecting,
    /// Socket open, frames flowing.
    Connected,
    /// Last attempt failed. A retry may be pending unless attempts ran out.
    Error,
}

impl ConnectionState {
    /// Lowercase label for display.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buffered transitions per [`StateChange`] receiver before it lags.
const STATE_CHANGE_CAPACITY: usize = 64;

/// How long `reconnect()` waits for the previous socket to close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// State entered.
    pub state: ConnectionState,
    /// Failure text when `Error` was entered by a failed attempt.
    pub error: Option<String>,
}

/// A running connection task.
struct Session {
    id: u64,
    cancel: CancellationToken,
    outgoing: mpsc::UnboundedSender<String>,
    last_error: Option<String>,
    task: JoinHandle<()>,
}

impl Session {
    /// Cancel the task and wait, bounded by [`CLOSE_GRACE`], for it to close
    /// its socket.
    async fn shut_down(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(CLOSE_GRACE, &mut self.task).await.is_err() {
            log::warn!("[Stream] Previous socket still open after {:?}", CLOSE_GRACE);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Inner {
    url: String,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    router: Arc<Router>,
    state_tx: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
    session: Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    initiated: AtomicBool,
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        // The slot only holds handles; a panic while it was held cannot leave
        // it half-written.
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a state change. Callers hold the session lock.
    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            log::debug!("[Stream] State -> {}", state);
            // Nobody listening is fine.
            let _ = self.changes.send(StateChange { state, error });
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }
}

/// Shared handle to the stream connection.
///
/// Cloning is cheap; every clone drives the same socket, state, and router.
/// When the last handle is dropped the connection task is cancelled.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.inner.url)
            .field("state", &self.inner.state())
            .field("policy", &self.inner.policy)
            .field("router", &self.inner.router)
            .finish_non_exhaustive()
    }
}

impl StreamConnection {
    /// Connection to `url` over WebSocket with real timers.
    #[must_use]
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self::with_parts(
            url,
            policy,
            Arc::new(WsTransport),
            Arc::new(TokioScheduler),
        )
    }

    /// Connection configured from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ws_url(), config.reconnect_policy())
    }

    /// Connection with an explicit transport and scheduler.
    #[must_use]
    pub fn with_parts(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                policy,
                transport,
                scheduler,
                router: Arc::new(Router::new()),
                state_tx,
                changes,
                session: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
                initiated: AtomicBool::new(false),
            }),
        }
    }

    /// Open the socket.
    ///
    /// Resolves once the socket is open. While an attempt is already in
    /// flight this waits for that attempt instead of opening a second socket;
    /// while connected it returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt fails (malformed URL, refused
    /// connection) or is cancelled by `disconnect()`. A failed attempt still
    /// leaves the retry schedule running.
    pub async fn connect(&self) -> Result<()> {
        // Subscribed under the session lock, so no transition of the
        // attempt we wait for can be missed.
        let mut changes = {
            let mut slot = self.inner.lock_session();
            match slot.as_ref().filter(|s| !s.task.is_finished()) {
                Some(session) => match self.inner.state() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Error => {
                        let reason = session
                            .last_error
                            .as_deref()
                            .unwrap_or("connection unavailable");
                        bail!("{reason} (retry pending)");
                    }
                    ConnectionState::Connecting | ConnectionState::Disconnected => {
                        log::debug!("[Stream] Attempt already in flight, waiting for it");
                        self.inner.changes.subscribe()
                    }
                },
                None => {
                    let changes = self.inner.changes.subscribe();
                    *slot = Some(self.spawn_session());
                    changes
                }
            }
        };

        loop {
            match changes.recv().await {
                Ok(StateChange {
                    state: ConnectionState::Connected,
                    ..
                }) => return Ok(()),
                Ok(StateChange {
                    state: ConnectionState::Error,
                    error,
                }) => return Err(anyhow!(error.unwrap_or_else(|| "connection failed".into()))),
                Ok(StateChange {
                    state: ConnectionState::Disconnected,
                    ..
                })
                | Err(RecvError::Closed) => bail!("connection attempt cancelled"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("[Stream] connect() skipped {} state changes", skipped);
                }
            }
        }
    }

    /// Start a new connection task. Caller holds the session lock.
    fn spawn_session(&self) -> Session {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        self.inner.set_state(ConnectionState::Connecting, None);

        let ctx = SessionContext {
            id,
            conn: Arc::downgrade(&self.inner),
            url: self.inner.url.clone(),
            transport: Arc::clone(&self.inner.transport),
            scheduler: Arc::clone(&self.inner.scheduler),
            router: Arc::clone(&self.inner.router),
            backoff: Backoff::new(self.inner.policy),
            cancel: cancel.clone(),
            outgoing_rx,
        };
        let task = tokio::spawn(run_connection_loop(ctx));

        Session {
            id,
            cancel,
            outgoing,
            last_error: None,
            task,
        }
    }

    /// Session guard for consumers.
    ///
    /// The first call spawns `connect()` in the background; later calls see
    /// the open or in-flight connection and do nothing. Returns `true` if
    /// this call initiated the connection.
    pub fn ensure_connected(&self) -> bool {
        if self.inner.initiated.swap(true, Ordering::SeqCst) {
            return false;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.connect().await {
                log::warn!("[Stream] Initial connection failed: {:#}", e);
            }
        });
        true
    }

    /// Queue an envelope for sending.
    ///
    /// Only queued while connected; otherwise a warning is logged and the
    /// envelope is dropped. Returns `true` if queued.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(frame) => self.send_frame(&envelope.kind, frame),
            Err(e) => {
                log::warn!("[Stream] Cannot encode '{}' frame: {:#}", envelope.kind, e);
                false
            }
        }
    }

    /// Queue a control frame (`start_logs` / `stop_logs`).
    pub fn send_control(&self, control: &ControlMessage) -> bool {
        self.send(&control.to_envelope())
    }

    fn send_frame(&self, kind: &EventKind, frame: String) -> bool {
        let slot = self.inner.lock_session();
        let queued = match slot.as_ref() {
            Some(session) if self.inner.state() == ConnectionState::Connected => {
                session.outgoing.send(frame).is_ok()
            }
            _ => false,
        };
        if queued {
            log::trace!("[Stream] Queued '{}' frame", kind);
        } else {
            log::warn!("[Stream] Not connected, dropping outgoing '{}' frame", kind);
        }
        queued
    }

    /// Close the socket, cancel any pending retry, and remove every
    /// subscription.
    pub fn disconnect(&self) {
        let session = self.take_session();
        if session.is_some() {
            log::info!("[Stream] Disconnecting from {}", self.inner.url);
        }
        drop(session);
        self.inner.router.clear();
        self.inner.initiated.store(false, Ordering::SeqCst);
    }

    /// Force a fresh connection.
    ///
    /// Closes any socket and pending retry, waits for the old socket to be
    /// closed, then connects immediately with a fresh attempt counter.
    /// Subscriptions are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the new attempt fails.
    pub async fn reconnect(&self) -> Result<()> {
        log::info!("[Stream] Manual reconnect requested");
        if let Some(session) = self.take_session() {
            session.shut_down().await;
        }
        self.connect().await
    }

    /// Detach the live session and mark the connection disconnected. Dropping
    /// the returned session cancels its task.
    fn take_session(&self) -> Option<Session> {
        let mut slot = self.inner.lock_session();
        let session = slot.take();
        self.inner.set_state(ConnectionState::Disconnected, None);
        session
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver for the latest state. Rapid transitions may be coalesced.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every transition from now on, in order, with the failure text of
    /// failed attempts.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }

    /// True while the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Shared router.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Subscribe on the shared router.
    pub fn subscribe(&self, kind: impl Into<EventKind>, callback: Callback) -> Subscription {
        self.inner.router.subscribe(kind, callback)
    }

    /// Subscribe a closure on the shared router.
    pub fn on<F>(&self, kind: impl Into<EventKind>, f: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.router.on(kind, f)
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

/// Everything the connection task owns.
struct SessionContext {
    id: u64,
    conn: Weak<Inner>,
    url: String,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    router: Arc<Router>,
    backoff: Backoff,
    cancel: CancellationToken,
    outgoing_rx: mpsc::UnboundedReceiver<String>,
}

impl SessionContext {
    /// Publish `state` (with the failure text of a failed attempt) if this
    /// session is still the live one. Returns `false` once superseded.
    fn report(&self, state: ConnectionState, error: Option<String>) -> bool {
        let Some(inner) = self.conn.upgrade() else {
            return false;
        };
        let mut slot = inner.lock_session();
        let Some(session) = slot.as_mut().filter(|s| s.id == self.id) else {
            return false;
        };
        if error.is_some() {
            session.last_error.clone_from(&error);
        }
        inner.set_state(state, error);
        true
    }
}

/// Result of the inner message loop.
enum ConnectionLoopExit {
    /// Cancelled by `disconnect()`, `reconnect()`, or the last handle dropping.
    Shutdown,
    /// Socket lost; retry if attempts remain.
    Disconnected,
}

/// Background task for one session: open, pump frames, retry.
async fn run_connection_loop(mut ctx: SessionContext) {
    loop {
        if ctx.cancel.is_cancelled() || !ctx.report(ConnectionState::Connecting, None) {
            return;
        }

        log::info!("[Stream] Connecting to {}", ctx.url);
        let opened = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            result = ctx.transport.open(&ctx.url) => result,
        };

        match opened {
            Ok((mut sink, mut stream)) => {
                log::info!("[Stream] WebSocket connected");
                ctx.backoff.reset();

                // Frames queued for an earlier socket are stale.
                while ctx.outgoing_rx.try_recv().is_ok() {}

                if !ctx.report(ConnectionState::Connected, None) {
                    let _ = sink.close().await;
                    return;
                }

                let exit = run_message_loop(&mut ctx, sink.as_mut(), stream.as_mut()).await;
                if let ConnectionLoopExit::Shutdown = exit {
                    flush_and_close(&mut ctx, sink.as_mut()).await;
                    return;
                }
                if !ctx.report(ConnectionState::Connecting, None) {
                    return;
                }
            }
            Err(e) => {
                log::warn!("[Stream] Connection failed: {:#}", e);
                if !ctx.report(ConnectionState::Error, Some(format!("{e:#}"))) {
                    return;
                }
            }
        }

        let Some(delay) = ctx.backoff.next_delay() else {
            log::error!(
                "[Stream] Max reconnection attempts reached ({}), giving up",
                ctx.backoff.max_attempts()
            );
            ctx.report(ConnectionState::Error, None);
            return;
        };

        log::info!(
            "[Stream] Attempting to reconnect in {:?} ({}/{})",
            delay,
            ctx.backoff.attempts(),
            ctx.backoff.max_attempts()
        );
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            () = ctx.scheduler.sleep(delay) => {}
        }
    }
}

/// Inner loop for one open socket.
///
/// Dispatches inbound text frames in arrival order, writes queued outgoing
/// frames, and answers pings. Returns when the socket is lost or the session
/// is cancelled.
async fn run_message_loop(
    ctx: &mut SessionContext,
    sink: &mut dyn FrameSink,
    stream: &mut dyn FrameStream,
) -> ConnectionLoopExit {
    loop {
        tokio::select! {
            biased;

            () = ctx.cancel.cancelled() => {
                log::info!("[Stream] Shutdown requested, closing connection");
                return ConnectionLoopExit::Shutdown;
            }

            Some(frame) = ctx.outgoing_rx.recv() => {
                if let Err(e) = sink.send_text(&frame).await {
                    log::warn!("[Stream] Failed to send frame: {:#}", e);
                    return ConnectionLoopExit::Disconnected;
                }
            }

            msg = stream.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        ctx.router.dispatch_frame(&text);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = sink.send_pong(data).await {
                            log::debug!("[Stream] Failed to answer ping: {:#}", e);
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        log::debug!("[Stream] Ignoring {}-byte binary frame", data.len());
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Stream] Connection closed by server ({} {})", code, reason);
                        return ConnectionLoopExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Stream] WebSocket error: {:#}", e);
                        return ConnectionLoopExit::Disconnected;
                    }
                    None => {
                        log::info!("[Stream] WebSocket stream ended");
                        return ConnectionLoopExit::Disconnected;
                    }
                }
            }
        }
    }
}

/// Write frames queued before shutdown (e.g. a final `stop_logs`), then close.
async fn flush_and_close(ctx: &mut SessionContext, sink: &mut dyn FrameSink) {
    while let Ok(frame) = ctx.outgoing_rx.try_recv() {
        if let Err(e) = sink.send_text(&frame).await {
            log::debug!("[Stream] Dropped frame during shutdown: {:#}", e);
            break;
        }
    }
    if let Err(e) = sink.close().await {
        log::debug!("[Stream] Close failed: {:#}", e);
    }
}

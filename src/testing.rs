//! In-process transport and scheduler doubles for connection tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::reconnect::Scheduler;
use crate::transport::{FrameSink, FrameStream, Socket, Transport};
use crate::ws::WsMessage;

/// Upper bound for any single wait in tests.
pub(crate) const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct TransportState {
    fail_all: bool,
    fail_next: usize,
    peers: Vec<Arc<MemoryPeer>>,
}

/// Transport whose sockets are channel pairs.
///
/// Every `open` counts as an attempt. A gated transport holds each attempt
/// until [`MemoryTransport::release_opens`] lets it through.
#[derive(Debug)]
pub(crate) struct MemoryTransport {
    state: Mutex<TransportState>,
    attempts: watch::Sender<usize>,
    gate: Option<Semaphore>,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::default()),
            attempts: watch::channel(0).0,
            gate: None,
        }
    }

    pub(crate) fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub(crate) fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    pub(crate) fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub(crate) fn release_opens(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    pub(crate) async fn wait_for_attempts(&self, count: usize) {
        let mut rx = self.attempts.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for open attempts")
            .expect("attempt counter closed");
    }

    /// Server side of the `index`-th successfully opened socket.
    pub(crate) fn peer(&self, index: usize) -> Arc<MemoryPeer> {
        Arc::clone(&self.state.lock().unwrap().peers[index])
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Socket> {
        self.attempts.send_modify(|n| *n += 1);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_all || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Err(anyhow!("connection refused: {url}"));
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (pong_tx, pongs) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        state.peers.push(Arc::new(MemoryPeer {
            to_client: Mutex::new(Some(to_client)),
            from_client: tokio::sync::Mutex::new(from_client),
            pongs: tokio::sync::Mutex::new(pongs),
            client_closed: Arc::clone(&closed),
        }));

        Ok((
            Box::new(MemorySink {
                to_server,
                pongs: pong_tx,
                closed,
            }),
            Box::new(MemoryStream { from_server }),
        ))
    }
}

/// Server end of one in-memory socket.
#[derive(Debug)]
pub(crate) struct MemoryPeer {
    to_client: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    from_client: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    pongs: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    client_closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub(crate) fn send(&self, msg: WsMessage) {
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }

    pub(crate) fn send_text(&self, text: &str) {
        self.send(WsMessage::Text(text.to_string()));
    }

    /// Send a close frame and end the stream.
    pub(crate) fn close(&self) {
        self.send(WsMessage::Close {
            code: 1000,
            reason: String::new(),
        });
        self.to_client.lock().unwrap().take();
    }

    pub(crate) async fn next_sent(&self) -> String {
        let mut rx = self.from_client.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client sink dropped")
    }

    pub(crate) async fn next_pong(&self) -> Vec<u8> {
        let mut rx = self.pongs.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for pong")
            .expect("client sink dropped")
    }

    pub(crate) fn is_client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_client_closed(&self) {
        tokio::time::timeout(WAIT, async {
            while !self.client_closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client never closed the socket");
    }
}

struct MemorySink {
    to_server: mpsc::UnboundedSender<String>,
    pongs: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("socket closed"));
        }
        self.to_server
            .send(text.to_string())
            .map_err(|_| anyhow!("peer gone"))
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.pongs.send(data).map_err(|_| anyhow!("peer gone"))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryStream {
    from_server: mpsc::UnboundedReceiver<WsMessage>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        self.from_server.recv().await.map(Ok)
    }
}

/// Scheduler that records every requested delay.
///
/// `immediate` resolves each sleep after a yield; `held` blocks each sleep
/// until [`ManualScheduler::release`] is called.
#[derive(Debug)]
pub(crate) struct ManualScheduler {
    delays: Mutex<Vec<Duration>>,
    sleeps: watch::Sender<usize>,
    gate: Option<Semaphore>,
}

impl ManualScheduler {
    pub(crate) fn immediate() -> Self {
        Self {
            delays: Mutex::new(Vec::new()),
            sleeps: watch::channel(0).0,
            gate: None,
        }
    }

    pub(crate) fn held() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::immediate()
        }
    }

    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }

    pub(crate) fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub(crate) async fn wait_for_sleeps(&self, count: usize) {
        let mut rx = self.sleeps.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for scheduled retry")
            .expect("sleep counter closed");
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
        self.sleeps.send_modify(|n| *n += 1);
        match &self.gate {
            Some(gate) => {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            None => tokio::task::yield_now().await,
        }
    }
}

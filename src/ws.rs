//! WebSocket plumbing for the stream endpoint.
//!
//! Wraps `tokio-tungstenite` so the connection task never sees its types.
//! [`connect`] performs the handshake (bounded by [`OPEN_TIMEOUT`]) and splits
//! the socket into a [`WsWriter`] / [`WsReader`] pair; [`WsMessage`] is the
//! crate's own view of an inbound frame.
//!
//! The URL helpers turn the configured `http(s)` base into the `ws(s)`
//! endpoint.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Longest the opening handshake may take before the attempt counts as failed.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame (the event stream's JSON).
    Text(String),
    /// Binary frame; the stream never sends these.
    Binary(Vec<u8>),
    /// Ping with payload, to be echoed in a pong.
    Ping(Vec<u8>),
    /// Pong with payload.
    Pong(Vec<u8>),
    /// Server closed the socket.
    Close {
        /// Close code (1005 when the peer sent none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl WsMessage {
    /// Map a tungstenite message. Raw frames have no counterpart.
    fn from_tungstenite(msg: Message) -> Option<Self> {
        Some(match msg {
            Message::Text(text) => Self::Text(text.to_string()),
            Message::Binary(data) => Self::Binary(data.to_vec()),
            Message::Ping(data) => Self::Ping(data.to_vec()),
            Message::Pong(data) => Self::Pong(data.to_vec()),
            Message::Close(frame) => match frame {
                Some(frame) => Self::Close {
                    code: frame.code.into(),
                    reason: frame.reason.to_string(),
                },
                None => Self::Close {
                    code: 1005,
                    reason: String::new(),
                },
            },
            Message::Frame(_) => return None,
        })
    }
}

/// Outbound half of an open socket.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    async fn feed(&mut self, msg: Message, what: &'static str) -> Result<()> {
        self.sink
            .send(msg)
            .await
            .with_context(|| format!("WebSocket {what} failed"))
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.feed(Message::Text(text.to_owned()), "send").await
    }

    /// Echo a ping payload.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.feed(Message::Pong(data), "pong").await
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Inbound half of an open socket.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next frame, or `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(msg) => {
                    if let Some(msg) = WsMessage::from_tungstenite(msg) {
                        return Some(Ok(msg));
                    }
                }
                Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket read failed"))),
            }
        }
        None
    }
}

/// Open a socket to `url` and split it.
///
/// # Errors
///
/// Returns an error if the URL is malformed, the handshake fails, or it
/// takes longer than [`OPEN_TIMEOUT`].
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let handshake = tokio_tungstenite::connect_async(request);
    let (socket, _response) = tokio::time::timeout(OPEN_TIMEOUT, handshake)
        .await
        .with_context(|| format!("WebSocket handshake with {url} timed out"))?
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Rewrite an `http(s)://` URL to `ws(s)://`; anything else passes through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Join a base URL and a stream path into a WebSocket endpoint.
///
/// The path gains a leading `/` if missing, a trailing `/` on the base is
/// dropped, and an `http(s)` base is rewritten to `ws(s)`.
#[must_use]
pub fn build_ws_url(base_url: &str, path: &str) -> String {
    let base = http_to_ws_scheme(base_url.trim_end_matches('/'));
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

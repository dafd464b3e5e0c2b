//! Transport seam for the stream connection.
//!
//! [`Transport`] opens one physical socket and hands back independent
//! send/receive halves. The connection task only talks to these traits, so
//! the production WebSocket ([`WsTransport`]) can be swapped for an
//! in-process transport in tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Sending half of an open socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Answer a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Close the socket gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of an open socket.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound message; `None` once the socket is gone.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// Opened socket halves.
pub type Socket = (Box<dyn FrameSink>, Box<dyn FrameStream>);

/// Opens sockets to the stream endpoint.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Open a socket to `url`. Resolves once the socket is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or the peer refuses.
    async fn open(&self, url: &str) -> Result<Socket>;
}

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Socket> {
        let (writer, reader) = ws::connect(url).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        WsWriter::send_text(self, text).await
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        WsWriter::send_pong(self, data).await
    }

    async fn close(&mut self) -> Result<()> {
        WsWriter::close(self).await
    }
}

#[async_trait]
impl FrameStream for WsReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        WsReader::recv(self).await
    }
}

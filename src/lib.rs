//! Dockstream - real-time event distribution for a container dashboard.
//!
//! This crate holds one long-lived WebSocket to the dashboard backend and
//! fans the JSON frames it carries out to independent consumers, each of
//! which keeps a bounded log of the newest entries it has seen, oldest first.
//!
//! # Architecture
//!
//! - **Connection** - owns the socket, retries with linear backoff
//! - **Router** - demultiplexes frames to subscribers by `type`
//! - **Log buffers** - keep-last-N storage per consumer
//! - **Consumers** - footer panel and container log viewer policies
//!
//! # Modules
//!
//! - [`connection`] - [`StreamConnection`] lifecycle and session task
//! - [`reconnect`] - backoff policy and injectable scheduler
//! - [`router`] - subscription registry and dispatch
//! - [`envelope`] / [`event`] - wire frames and normalized events
//! - [`log_buffer`] - bounded entry storage
//! - [`consumer`] - mounted stream consumers
//! - [`config`] - configuration loading/saving

// Library modules
pub mod connection;
pub mod consumer;
pub mod reconnect;
pub mod router;
pub mod transport;
pub mod ws;

pub mod config;
pub mod envelope;
pub mod env;
pub mod event;
pub mod log_buffer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use connection::{ConnectionState, StateChange, StreamConnection};
pub use consumer::{FooterPanel, LogViewer};
pub use envelope::{ControlMessage, Envelope, EventKind, Level};
pub use event::{Event, LogEntry};
pub use log_buffer::LogBuffer;
pub use reconnect::ReconnectPolicy;
pub use router::{Callback, Router, Subscription};

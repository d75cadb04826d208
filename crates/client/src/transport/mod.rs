//! Transport abstraction for the RPC channel.
//!
//! The channel only needs a message-oriented duplex pipe carrying text
//! frames. The seam exists so tests can drive a channel with a scripted peer
//! and hosts can substitute their own socket stack.

mod ws;

pub use ws::WsTransport;

use async_trait::async_trait;

use protocol::error::Result;

/// Something the channel can read from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Text(String),
    /// The connection ended. `code` is the close code if the peer sent one.
    Closed { code: Option<u16>, reason: String },
}

/// Write half of an open connection.
#[async_trait]
pub trait TransportSink: Send {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Initiates a close with an optional code and reason.
    async fn close(&mut self, code: Option<u16>, reason: &str) -> Result<()>;
}

/// Read half of an open connection. Yields `None` after `Closed`.
#[async_trait]
pub trait TransportStream: Send {
    async fn next(&mut self) -> Option<TransportEvent>;
}

/// An open connection, split into halves so the read loop can run
/// independently of writers.
pub struct TransportPair {
    pub sink: Box<dyn TransportSink>,
    pub stream: Box<dyn TransportStream>,
}

/// Factory for connections. One `open` call per connection attempt; a
/// connection is never reused across attempts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportPair>;
}

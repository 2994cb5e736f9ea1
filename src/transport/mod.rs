//! Transport boundary for the event channel
//!
//! The channel only needs a bidirectional text connection: open it, read
//! inbound messages until the peer goes away or errors, send the occasional
//! keep-alive, and close it. `WebSocketTransport` is the production
//! implementation.

use async_trait::async_trait;

pub mod websocket;

#[cfg(test)]
pub(crate) mod scripted;

pub use websocket::WebSocketTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("no inbound traffic for {0}ms")]
    IdleTimeout(u64),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// Opens connections to the live event source
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, address: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open connection.
///
/// `recv` is polled inside `tokio::select!`, so it must be cancel-safe: a
/// dropped `recv` future must not lose a message.
#[async_trait]
pub trait Connection: Send {
    /// Next inbound text message, `None` once the peer has closed
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Best-effort graceful close
    async fn close(&mut self);
}

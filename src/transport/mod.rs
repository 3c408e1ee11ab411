//! Transport layer for the persistent connection
//!
//! This module provides the transport abstraction the connection manager drives,
//! plus the WebSocket implementation used in production. Tests substitute the
//! scripted connector from [`crate::testing::mocks`].

use thiserror::Error;

pub mod ws;

pub use ws::WsConnector;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer closed without sending a status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close handshake
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Forced close after the peer stopped answering heartbeats
pub const CLOSE_HEARTBEAT_MISSED: u16 = 4000;

/// Frames surfaced by an open connection
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Text payload
    Text(String),
    /// Peer-initiated close
    Closed { code: u16, reason: String },
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Write failed: {0}")]
    Send(String),
    #[error("Read failed: {0}")]
    Receive(String),
    #[error("Close failed: {0}")]
    Close(String),
}

/// Opens connections to an endpoint
///
/// The manager calls this once per attempt; the returned future is dropped when the
/// attempt times out or is cancelled, which must abort the handshake.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// An open bidirectional text connection
///
/// `next_frame` must be cancel safe: the manager polls it inside `tokio::select!`.
#[async_trait::async_trait]
pub trait Connection: Send {
    /// Write one text frame
    async fn send_text(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the stream has ended without a close frame
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Start the close handshake with the given code and reason
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Whether the connection is still usable for writes
    fn is_open(&self) -> bool;
}

//! Transport seam between the connection manager and the network.
//!
//! - `WebSocketTransport`: production transport over `tokio-tungstenite`
//! - `MemoryTransport`: scripted in-process transport for tests and demos

mod memory;
mod websocket;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub use memory::{DialOutcome, MemoryListener, MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Close code for a normal, intentional close
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection timed out")]
    Timeout,

    #[error("upgrade rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Failures that retrying cannot fix: the endpoint does not exist or
    /// refuses this client.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::Rejected {
                status: 401 | 403 | 404 | 410,
                ..
            }
        )
    }
}

/// What a live connection yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

/// Dials the endpoint. One `Transport` is shared for the client's lifetime.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// A single full-duplex connection.
///
/// `recv` must be cancel-safe: the connection task polls it inside
/// `tokio::select!` alongside timers and commands.
#[async_trait]
pub trait TransportConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next event; `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>>;

    async fn close(&mut self, code: u16, reason: &str);
}

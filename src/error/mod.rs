use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Circuit breaker open, next attempt in {}ms", retry_in.as_millis())]
    CircuitOpen { retry_in: Duration },

    #[error("Connection degraded: {reason}")]
    Degraded { reason: String },

    #[error("Disconnected before the connection was established")]
    Disconnected,

    #[error("Client has been shut down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RealtimeError {
    /// Stable machine-readable code, mirrored in logs and UI error banners.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Config(_) | RealtimeError::InvalidSettings(_) => "CONFIG_ERROR",
            RealtimeError::InvalidUrl(_) => "INVALID_URL",
            RealtimeError::InvalidChannel(_) => "INVALID_CHANNEL",
            RealtimeError::Transport(_) => "TRANSPORT_ERROR",
            RealtimeError::Protocol(_) => "PROTOCOL_ERROR",
            RealtimeError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            RealtimeError::Degraded { .. } => "DEGRADED",
            RealtimeError::Disconnected => "DISCONNECTED",
            RealtimeError::Shutdown => "SHUTDOWN",
            RealtimeError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether waiting (or a manual retry) can make the operation succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RealtimeError::Transport(e) => !e.is_permanent(),
            RealtimeError::CircuitOpen { .. }
            | RealtimeError::Degraded { .. }
            | RealtimeError::Disconnected => true,
            _ => false,
        }
    }
}

/// Error delivered to a subscription's error callback when the server
/// rejects the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionError {
    pub channel: String,
    pub code: String,
    pub message: String,
    /// Whether the registry has scheduled another subscribe attempt.
    pub will_retry: bool,
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "subscription to {} rejected ({}): {}",
            self.channel, self.code, self.message
        )
    }
}

impl std::error::Error for SubscriptionError {}

pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RealtimeError::Shutdown.code(), "SHUTDOWN");
        assert_eq!(
            RealtimeError::CircuitOpen {
                retry_in: Duration::from_millis(1500)
            }
            .code(),
            "CIRCUIT_OPEN"
        );
    }

    #[test]
    fn test_permanent_transport_error_is_not_recoverable() {
        let err = RealtimeError::from(TransportError::Rejected {
            status: 404,
            message: "not found".to_string(),
        });
        assert!(!err.is_recoverable());

        let err = RealtimeError::from(TransportError::Timeout);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_circuit_open_display() {
        let err = RealtimeError::CircuitOpen {
            retry_in: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Circuit breaker open, next attempt in 1500ms");
    }
}

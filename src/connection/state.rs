use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Coarse status for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

/// Snapshot of the singleton connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// Consecutive failed attempts; reset on a successful handshake
    pub attempt: u32,
    /// Assigned by the server on each handshake
    pub connection_id: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// A retry timer is pending
    pub retry_scheduled: bool,
    /// Retries are exhausted; only `force_reconnect` recovers
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl ConnectionInfo {
    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Disconnected if self.degraded || self.last_error.is_some() => {
                ConnectionStatus::Error
            }
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
        }
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            connection_id: None,
            last_connected_at: None,
            last_disconnected_at: None,
            retry_scheduled: false,
            degraded: false,
            last_error: None,
        }
    }
}

/// Lifecycle and error notifications, delivered over a broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting { attempt: u32 },
    Connected { connection_id: String },
    Disconnected {
        code: u16,
        reason: String,
        will_retry: bool,
    },
    RetryScheduled { attempt: u32, delay: Duration },
    /// The circuit breaker refused an attempt
    ConnectRejected { retry_in: Duration },
    CircuitOpened,
    HeartbeatTimeout,
    Degraded { reason: String },
    Error { message: String, recoverable: bool },
    SubscriptionRejected { channel: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let mut info = ConnectionInfo::default();
        assert_eq!(info.status(), ConnectionStatus::Disconnected);

        info.last_error = Some("connection refused".to_string());
        assert_eq!(info.status(), ConnectionStatus::Error);

        info.state = ConnectionState::Connecting;
        assert_eq!(info.status(), ConnectionStatus::Connecting);

        info.state = ConnectionState::Connected;
        assert_eq!(info.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connecting).unwrap(),
            "\"connecting\""
        );
    }
}

// Foundation (pure policies and shared types)
pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod queue;

// Wire layer
pub mod protocol;
pub mod transport;

// Client core
pub mod connection;
pub mod subscription;

// Supporting modules
pub mod metrics;
pub mod stats;

pub use config::Settings;
pub use connection::{ConnectionEvent, ConnectionInfo, ConnectionState, ConnectionStatus, RealtimeClient};
pub use error::{RealtimeError, Result, SubscriptionError};
pub use protocol::ChannelMessage;
pub use queue::Priority;
pub use stats::StatsSnapshot;
pub use subscription::{SubscriptionHandle, SubscriptionId, SubscriptionOptions};

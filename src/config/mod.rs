mod settings;

pub use settings::{
    ConnectionConfig, LogConfig, LogFormat, QueueConfig, ReconnectionConfig, Settings,
    SubscriptionRetryConfig,
};

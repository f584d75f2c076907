use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{RealtimeError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub subscription_retry: SubscriptionRetryConfig,
    /// Channels subscribed by the command line tail tool
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Base endpoint, e.g. `ws://localhost:8000/ws`
    #[serde(default = "default_url")]
    pub url: String,
    /// Opaque client identifier appended to the endpoint path
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Dial plus handshake deadline in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Pong deadline in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Client ping interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectionConfig {
    /// Consecutive failures before the circuit breaker opens
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Consecutive breaker trips tolerated before the connection is degraded
    #[serde(default = "default_max_open_cycles")]
    pub max_open_cycles: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Bound of each priority bucket
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    /// Re-queues allowed for a message whose write failed during drain
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRetryConfig {
    #[serde(default = "default_subscription_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_subscription_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_client_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_message_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_max_open_cycles() -> u32 {
    5
}

fn default_max_buffer() -> usize {
    100
}

fn default_max_send_retries() -> u32 {
    3
}

fn default_subscription_max_retries() -> u32 {
    3
}

fn default_subscription_max_delay_ms() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from `.env`, `config/default`, `config/{RUN_MODE}` and
    /// `REALTIME__*` environment variables, in increasing precedence.
    pub fn new() -> std::result::Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("connection.url", default_url())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // REALTIME__CONNECTION__URL, REALTIME__RECONNECTION__MAX_ATTEMPTS, REALTIME__CHANNELS=a,b
            .add_source(
                Environment::with_prefix("REALTIME")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("channels"),
            );

        builder.build()?.try_deserialize()
    }

    /// Settings pointed at `url` with every other value defaulted.
    pub fn for_endpoint(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig {
                url: url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject values the connection manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(RealtimeError::InvalidSettings(msg.to_string()));

        if self.connection.url.trim().is_empty() {
            return invalid("connection.url must not be empty");
        }
        if self.connection.client_id.trim().is_empty() {
            return invalid("connection.client_id must not be empty");
        }
        if self.connection.connection_timeout_ms == 0
            || self.connection.message_timeout_ms == 0
            || self.connection.heartbeat_interval_ms == 0
        {
            return invalid("connection timeouts and heartbeat interval must be non-zero");
        }
        if self.reconnection.max_attempts == 0 {
            return invalid("reconnection.max_attempts must be at least 1");
        }
        if self.reconnection.max_open_cycles == 0 {
            return invalid("reconnection.max_open_cycles must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.reconnection.jitter_factor) {
            return invalid("reconnection.jitter_factor must be within [0, 1]");
        }
        if self.reconnection.backoff_multiplier < 1.0 {
            return invalid("reconnection.backoff_multiplier must be >= 1");
        }
        if self.reconnection.base_delay_ms > self.reconnection.max_delay_ms {
            return invalid("reconnection.base_delay_ms must not exceed max_delay_ms");
        }
        if self.subscription_retry.base_delay_ms > self.subscription_retry.max_delay_ms {
            return invalid("subscription_retry.base_delay_ms must not exceed max_delay_ms");
        }
        if self.queue.max_buffer == 0 {
            return invalid("queue.max_buffer must be at least 1");
        }

        self.endpoint_url().map(|_| ())
    }

    /// Full dial URL: `ws(s)://<host>/<endpoint>/<client_id>`.
    ///
    /// `http`/`https` bases are rewritten to `ws`/`wss`.
    pub fn endpoint_url(&self) -> Result<Url> {
        let mut url = Url::parse(self.connection.url.trim())?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(RealtimeError::InvalidSettings(format!(
                    "unsupported endpoint scheme {:?}",
                    other
                )))
            }
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme).map_err(|_| {
                RealtimeError::InvalidSettings("cannot rewrite endpoint scheme".to_string())
            })?;
        }

        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.connection.client_id
        );
        url.set_path(&path);

        Ok(url)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connection_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.message_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.connection.heartbeat_interval_ms)
    }
}

impl ReconnectionConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

impl SubscriptionRetryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reconnection: ReconnectionConfig::default(),
            queue: QueueConfig::default(),
            subscription_retry: SubscriptionRetryConfig::default(),
            channels: vec![],
            log: LogConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            client_id: default_client_id(),
            user_id: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            max_open_cycles: default_max_open_cycles(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_buffer: default_max_buffer(),
            max_send_retries: default_max_send_retries(),
        }
    }
}

impl Default for SubscriptionRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_subscription_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_subscription_max_delay_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.reconnection.max_attempts, 5);
        assert_eq!(settings.queue.max_buffer, 100);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_client_id_is_generated() {
        let a = ConnectionConfig::default();
        let b = ConnectionConfig::default();
        assert!(!a.client_id.is_empty());
        assert_ne!(a.client_id, b.client_id);
    }

    #[test]
    fn test_endpoint_url_appends_client_id() {
        let mut settings = Settings::for_endpoint("ws://dashboard.local/ws/");
        settings.connection.client_id = "client-1".to_string();

        let url = settings.endpoint_url().unwrap();
        assert_eq!(url.as_str(), "ws://dashboard.local/ws/client-1");
    }

    #[test]
    fn test_endpoint_url_rewrites_http_scheme() {
        let mut settings = Settings::for_endpoint("https://dashboard.local/api/v1/ws");
        settings.connection.client_id = "abc".to_string();

        let url = settings.endpoint_url().unwrap();
        assert_eq!(url.as_str(), "wss://dashboard.local/api/v1/ws/abc");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.reconnection.jitter_factor = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.queue.max_buffer = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.reconnection.max_open_cycles = 0;
        assert!(matches!(
            settings.validate(),
            Err(RealtimeError::InvalidSettings(_))
        ));

        let mut settings = Settings::default();
        settings.subscription_retry.base_delay_ms = 20_000;
        settings.subscription_retry.max_delay_ms = 10_000;
        assert!(settings.validate().is_err());

        let settings = Settings::for_endpoint("ftp://example.com/ws");
        assert!(matches!(
            settings.validate(),
            Err(RealtimeError::InvalidSettings(_))
        ));

        let settings = Settings::for_endpoint("not a url");
        assert!(matches!(settings.validate(), Err(RealtimeError::InvalidUrl(_))));
    }

    #[test]
    fn test_reconnection_policy_mapping() {
        let config = ReconnectionConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            max_open_cycles: 2,
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }
}

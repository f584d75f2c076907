use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::SubscriptionError;
use crate::protocol::{ChannelMessage, WireSubscriptionOptions};
use crate::queue::Priority;

/// Identifies one handler registration; unique per client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked for each data frame on a channel
pub type MessageHandler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Callback invoked when the server rejects a channel
pub type ErrorHandler = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;

/// Per-subscription delivery options.
///
/// The channel-level fields (`auto_resubscribe`, `buffer_messages`,
/// `max_buffer`, `priority`, `retry_on_error`) are taken from the first
/// subscriber of a channel; `on_error` is kept per handler.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Re-send the subscribe frame after every reconnect
    pub auto_resubscribe: bool,
    /// Buffer messages while paused instead of dropping them
    pub buffer_messages: bool,
    /// Bound on the paused buffer; oldest messages are dropped first
    pub max_buffer: usize,
    /// Default priority for sends on this channel
    pub priority: Priority,
    /// Retry the subscribe with backoff after a server rejection
    pub retry_on_error: bool,
    pub on_error: Option<ErrorHandler>,
}

impl SubscriptionOptions {
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SubscriptionError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn wire(&self) -> WireSubscriptionOptions {
        WireSubscriptionOptions {
            priority: self.priority,
            buffer_messages: self.buffer_messages,
            max_buffer: self.max_buffer,
        }
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            auto_resubscribe: true,
            buffer_messages: false,
            max_buffer: 100,
            priority: Priority::Normal,
            retry_on_error: false,
            on_error: None,
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("auto_resubscribe", &self.auto_resubscribe)
            .field("buffer_messages", &self.buffer_messages)
            .field("max_buffer", &self.max_buffer)
            .field("priority", &self.priority)
            .field("retry_on_error", &self.retry_on_error)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Channel information
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub channel: String,
    pub handler_count: usize,
    /// Acknowledged by the server on the current connection
    pub active: bool,
    pub priority: Priority,
    pub auto_resubscribe: bool,
}

/// Tally of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub buffered: usize,
    pub dropped: usize,
    pub panicked: usize,
}

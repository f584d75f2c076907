use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{RealtimeError, Result, SubscriptionError};
use crate::protocol::{ChannelMessage, WireSubscriptionOptions, SYSTEM_CHANNEL};
use crate::queue::Priority;

use super::types::{
    DispatchOutcome, ErrorHandler, MessageHandler, SubscriptionId, SubscriptionInfo,
    SubscriptionOptions,
};

/// Longest channel name accepted
const MAX_CHANNEL_LEN: usize = 128;

/// Reject channel names the server would never route.
pub fn validate_channel(channel: &str) -> Result<()> {
    let valid = !channel.is_empty()
        && channel.len() <= MAX_CHANNEL_LEN
        && channel != SYSTEM_CHANNEL
        && !channel.chars().any(|c| c.is_whitespace() || c.is_control());

    if valid {
        Ok(())
    } else {
        Err(RealtimeError::InvalidChannel(channel.to_string()))
    }
}

struct HandlerEntry {
    id: SubscriptionId,
    handler: MessageHandler,
    on_error: Option<ErrorHandler>,
    /// Cleared on unsubscribe; checked immediately before every call
    live: Arc<AtomicBool>,
    paused: bool,
    buffer: VecDeque<ChannelMessage>,
}

struct Subscription {
    channel: String,
    handlers: Vec<HandlerEntry>,
    options: SubscriptionOptions,
    /// Acknowledged by the server on the current connection
    active: bool,
    /// Connection generation the subscribe frame was last written on
    sent_generation: Option<u64>,
    /// Rejection retries used since the last acknowledgement
    retry_attempts: u32,
}

/// Result of [`SubscriptionRegistry::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: SubscriptionId,
    /// The channel had no subscribers before this call
    pub new_channel: bool,
}

/// Result of [`SubscriptionRegistry::remove`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub channel: String,
    /// The last handler went away and the channel was removed
    pub emptied: bool,
    pub sent_generation: Option<u64>,
}

/// Handler and buffered messages released by a resume
pub struct Resumed {
    id: SubscriptionId,
    handler: MessageHandler,
    live: Arc<AtomicBool>,
    pub messages: Vec<ChannelMessage>,
}

/// A server rejection routed to a channel's error callbacks
pub struct Rejection {
    /// Retry number scheduled (1-based), `None` when retries are off or spent
    pub retry_attempt: Option<u32>,
    callbacks: Vec<(Arc<AtomicBool>, ErrorHandler)>,
}

enum CallResult {
    Skipped,
    Delivered,
    Panicked,
}

fn call_handler(
    id: SubscriptionId,
    handler: &MessageHandler,
    live: &AtomicBool,
    message: &ChannelMessage,
) -> CallResult {
    if !live.load(Ordering::Acquire) {
        return CallResult::Skipped;
    }

    match catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(()) => CallResult::Delivered,
        Err(_) => {
            tracing::error!(
                subscription = %id,
                channel = %message.channel,
                kind = %message.kind,
                "Subscription handler panicked, continuing delivery"
            );
            CallResult::Panicked
        }
    }
}

/// Channel -> ordered handlers, in subscription order.
///
/// All callbacks run outside the lock on a snapshot of the handler list, so
/// a handler may subscribe or unsubscribe (itself or others) while it runs.
pub struct SubscriptionRegistry {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        // A panic while holding the lock can only come from our own
        // bookkeeping; the list itself is still consistent.
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` on `channel`.
    pub fn add(
        &self,
        channel: &str,
        handler: MessageHandler,
        options: SubscriptionOptions,
    ) -> Result<Registration> {
        validate_channel(channel)?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = HandlerEntry {
            id,
            handler,
            on_error: options.on_error.clone(),
            live: Arc::new(AtomicBool::new(true)),
            paused: false,
            buffer: VecDeque::new(),
        };

        let mut subs = self.lock();
        let new_channel = match subs.iter_mut().find(|s| s.channel == channel) {
            Some(existing) => {
                existing.handlers.push(entry);
                false
            }
            None => {
                subs.push(Subscription {
                    channel: channel.to_string(),
                    handlers: vec![entry],
                    options,
                    active: false,
                    sent_generation: None,
                    retry_attempts: 0,
                });
                true
            }
        };

        tracing::debug!(subscription = %id, channel = %channel, new_channel, "Handler registered");
        Ok(Registration { id, new_channel })
    }

    /// Remove one handler. Its liveness flag is cleared before this returns,
    /// so it is never invoked again.
    pub fn remove(&self, id: SubscriptionId) -> Option<Removal> {
        let mut subs = self.lock();

        let (index, position) = subs.iter().enumerate().find_map(|(i, s)| {
            s.handlers
                .iter()
                .position(|h| h.id == id)
                .map(|p| (i, p))
        })?;

        let entry = subs[index].handlers.remove(position);
        entry.live.store(false, Ordering::Release);

        let emptied = subs[index].handlers.is_empty();
        let removal = Removal {
            channel: subs[index].channel.clone(),
            emptied,
            sent_generation: subs[index].sent_generation,
        };
        if emptied {
            subs.remove(index);
        }

        tracing::debug!(subscription = %id, channel = %removal.channel, emptied, "Handler removed");
        Some(removal)
    }

    /// Stop delivering to `id`; messages are buffered or dropped per options.
    pub fn pause(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        match subs
            .iter_mut()
            .flat_map(|s| s.handlers.iter_mut())
            .find(|h| h.id == id)
        {
            Some(entry) => {
                entry.paused = true;
                true
            }
            None => false,
        }
    }

    /// Unpause `id` and take its buffered messages in arrival order.
    pub fn take_resumed(&self, id: SubscriptionId) -> Option<Resumed> {
        let mut subs = self.lock();
        let entry = subs
            .iter_mut()
            .flat_map(|s| s.handlers.iter_mut())
            .find(|h| h.id == id)?;

        entry.paused = false;
        Some(Resumed {
            id,
            handler: entry.handler.clone(),
            live: entry.live.clone(),
            messages: entry.buffer.drain(..).collect(),
        })
    }

    /// Deliver buffered messages released by a resume.
    pub fn deliver_resumed(&self, resumed: Resumed) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for message in &resumed.messages {
            match call_handler(resumed.id, &resumed.handler, &resumed.live, message) {
                CallResult::Delivered => outcome.delivered += 1,
                CallResult::Panicked => outcome.panicked += 1,
                CallResult::Skipped => break,
            }
        }
        outcome
    }

    /// Route a data frame to every handler on its channel, in subscription
    /// order.
    pub fn dispatch(&self, message: &ChannelMessage) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        let targets: Vec<(SubscriptionId, MessageHandler, Arc<AtomicBool>)> = {
            let mut subs = self.lock();
            let Some(sub) = subs.iter_mut().find(|s| s.channel == message.channel) else {
                tracing::debug!(channel = %message.channel, "No subscribers for channel, dropping frame");
                return outcome;
            };

            let buffer_messages = sub.options.buffer_messages;
            let max_buffer = sub.options.max_buffer.max(1);
            let mut targets = Vec::with_capacity(sub.handlers.len());

            for entry in sub.handlers.iter_mut() {
                if !entry.paused {
                    targets.push((entry.id, entry.handler.clone(), entry.live.clone()));
                } else if buffer_messages {
                    if entry.buffer.len() >= max_buffer {
                        entry.buffer.pop_front();
                        outcome.dropped += 1;
                    }
                    entry.buffer.push_back(message.clone());
                    outcome.buffered += 1;
                } else {
                    outcome.dropped += 1;
                }
            }
            targets
        };

        for (id, handler, live) in &targets {
            match call_handler(*id, handler, live, message) {
                CallResult::Delivered => outcome.delivered += 1,
                CallResult::Panicked => outcome.panicked += 1,
                CallResult::Skipped => {}
            }
        }

        outcome
    }

    /// Subscribe frames to write after connection `generation` was
    /// established, in registry order.
    ///
    /// Channels with `auto_resubscribe` are always included; others only if
    /// they have never been sent. Every subscription starts the connection
    /// unacknowledged.
    pub fn replay(&self, generation: u64) -> Vec<(String, WireSubscriptionOptions)> {
        let mut subs = self.lock();
        let mut frames = Vec::new();

        for sub in subs.iter_mut() {
            sub.active = false;
            sub.retry_attempts = 0;
            if sub.options.auto_resubscribe || sub.sent_generation.is_none() {
                sub.sent_generation = Some(generation);
                frames.push((sub.channel.clone(), sub.options.wire()));
            }
        }

        frames
    }

    /// Claim the subscribe frame for `channel` on connection `generation`.
    ///
    /// Returns `None` when the channel is gone or was already sent on this
    /// connection, which keeps a subscribe racing a reconnect to one frame.
    pub fn claim_subscribe(
        &self,
        channel: &str,
        generation: u64,
    ) -> Option<WireSubscriptionOptions> {
        let mut subs = self.lock();
        let sub = subs.iter_mut().find(|s| s.channel == channel)?;
        if sub.sent_generation == Some(generation) {
            return None;
        }
        sub.sent_generation = Some(generation);
        Some(sub.options.wire())
    }

    /// Claim a re-subscribe after a rejection; `None` if the channel went
    /// away or was acknowledged meanwhile.
    pub fn claim_retry(&self, channel: &str, generation: u64) -> Option<WireSubscriptionOptions> {
        let mut subs = self.lock();
        let sub = subs
            .iter_mut()
            .find(|s| s.channel == channel && !s.active)?;
        sub.sent_generation = Some(generation);
        Some(sub.options.wire())
    }

    /// Server acknowledged the subscribe.
    pub fn acknowledge(&self, channel: &str) -> bool {
        let mut subs = self.lock();
        match subs.iter_mut().find(|s| s.channel == channel) {
            Some(sub) => {
                sub.active = true;
                sub.retry_attempts = 0;
                true
            }
            None => false,
        }
    }

    /// Connection went away; nothing is acknowledged any more.
    pub fn deactivate_all(&self) {
        for sub in self.lock().iter_mut() {
            sub.active = false;
        }
    }

    /// Server rejected `channel`. Returns `None` when nobody subscribes to it.
    pub fn reject(&self, channel: &str, max_retries: u32) -> Option<Rejection> {
        let mut subs = self.lock();
        let sub = subs.iter_mut().find(|s| s.channel == channel)?;

        sub.active = false;
        let retry_attempt = if sub.options.retry_on_error && sub.retry_attempts < max_retries {
            sub.retry_attempts += 1;
            Some(sub.retry_attempts)
        } else {
            None
        };

        let callbacks = sub
            .handlers
            .iter()
            .filter_map(|h| h.on_error.clone().map(|cb| (h.live.clone(), cb)))
            .collect();

        Some(Rejection {
            retry_attempt,
            callbacks,
        })
    }

    /// Invoke the error callbacks of a rejection outside the lock.
    pub fn notify_rejection(&self, rejection: &Rejection, error: &SubscriptionError) -> usize {
        let mut panicked = 0;
        for (live, callback) in &rejection.callbacks {
            if !live.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                tracing::error!(channel = %error.channel, "Subscription error callback panicked");
                panicked += 1;
            }
        }
        panicked
    }

    /// Priority configured for `channel` by its first subscriber
    pub fn priority_for(&self, channel: &str) -> Option<Priority> {
        self.lock()
            .iter()
            .find(|s| s.channel == channel)
            .map(|s| s.options.priority)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.lock().iter().any(|s| s.channel == channel)
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn info(&self) -> Vec<SubscriptionInfo> {
        self.lock()
            .iter()
            .map(|s| SubscriptionInfo {
                channel: s.channel.clone(),
                handler_count: s.handlers.len(),
                active: s.active,
                priority: s.options.priority,
                auto_resubscribe: s.options.auto_resubscribe,
            })
            .collect()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

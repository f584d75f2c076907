//! The connection task.
//!
//! One task owns the transport connection, the circuit breaker, the outbound
//! queue and all timers. Everything else talks to it through [`Command`]s,
//! so state transitions happen on a single event-loop turn and timer
//! cancellation is immediate: a cancelled deadline is simply never polled
//! again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureOutcome};
use crate::config::Settings;
use crate::error::{RealtimeError, Result, SubscriptionError};
use crate::protocol::{encode_message, ClientFrame, ServerFrame, SubscriptionAction};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::stats::{DropReason, StatsCollector};
use crate::subscription::{DispatchOutcome, SubscriptionId, SubscriptionRegistry};
use crate::transport::{
    Transport, TransportConnection, TransportError, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL,
};

use super::state::{ConnectionEvent, ConnectionInfo, ConnectionState};

/// Close code sent when the server stops answering pings
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Requests from [`RealtimeClient`](super::RealtimeClient) handles
pub(crate) enum Command {
    Connect { reply: oneshot::Sender<Result<()>> },
    Disconnect,
    ForceReconnect,
    Send(QueuedMessage),
    Subscribe { channel: String },
    Unsubscribe {
        channel: String,
        sent_generation: Option<u64>,
    },
    Resume(SubscriptionId),
    NetworkStatus(bool),
    Shutdown { reply: oneshot::Sender<()> },
}

type Handshake = BoxFuture<'static, std::result::Result<Established, TransportError>>;

struct Established {
    conn: Box<dyn TransportConnection>,
    connection_id: String,
}

struct Link {
    conn: Box<dyn TransportConnection>,
    next_ping: Instant,
    /// Set when a ping is outstanding
    pong_deadline: Option<Instant>,
}

enum Phase {
    /// Disconnected with nothing scheduled
    Idle,
    /// Disconnected with a retry pending; `None` while offline
    Waiting { until: Option<Instant> },
    Connecting(Handshake),
    Connected(Link),
}

enum Event {
    Command(Option<Command>),
    RetryDue,
    Handshake(std::result::Result<Established, TransportError>),
    Link(Option<std::result::Result<TransportEvent, TransportError>>),
    PingDue,
    PongOverdue,
    SubscriptionRetryDue,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Dial and wait for `connection_established`, answering pings meanwhile.
async fn establish(
    transport: Arc<dyn Transport>,
    url: Url,
    stats: Arc<StatsCollector>,
) -> std::result::Result<Established, TransportError> {
    let mut conn = transport.connect(&url).await?;

    loop {
        match conn.recv().await {
            None => {
                return Err(TransportError::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "closed during handshake".to_string(),
                })
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(TransportEvent::Closed { code, reason })) => {
                return Err(TransportError::Closed { code, reason })
            }
            Some(Ok(TransportEvent::Text(text))) => {
                stats.record_received();
                match ServerFrame::parse(&text) {
                    Ok(ServerFrame::ConnectionEstablished { connection_id, .. }) => {
                        return Ok(Established {
                            conn,
                            connection_id,
                        })
                    }
                    Ok(ServerFrame::Ping) => {
                        let pong = ClientFrame::Pong
                            .encode()
                            .map_err(|e| TransportError::Protocol(e.to_string()))?;
                        conn.send(pong).await?;
                        stats.touch_heartbeat();
                    }
                    Ok(other) => {
                        tracing::debug!(kind = other.kind(), "Ignoring frame before handshake");
                    }
                    Err(e) => {
                        stats.record_malformed();
                        tracing::warn!(error = %e, "Dropping malformed frame during handshake");
                    }
                }
            }
        }
    }
}

pub(crate) struct ConnectionTask {
    settings: Settings,
    url: Url,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<StatsCollector>,
    info_tx: watch::Sender<ConnectionInfo>,
    events: broadcast::Sender<ConnectionEvent>,

    phase: Phase,
    info: ConnectionInfo,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    subscription_backoff: BackoffPolicy,
    queue: MessageQueue,
    /// Incremented on every successful handshake
    generation: u64,
    /// At least one handshake succeeded since init
    ever_connected: bool,
    online: bool,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Pending re-subscribes after a rejection
    subscription_retries: Vec<(Instant, String)>,
}

impl ConnectionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: Settings,
        url: Url,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedReceiver<Command>,
        registry: Arc<SubscriptionRegistry>,
        stats: Arc<StatsCollector>,
        info_tx: watch::Sender<ConnectionInfo>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: settings.reconnection.max_attempts,
        });
        let backoff = settings.reconnection.backoff_policy();
        let subscription_backoff = settings.subscription_retry.backoff_policy();
        let queue = MessageQueue::new(settings.queue.max_buffer);

        Self {
            settings,
            url,
            transport,
            commands,
            registry,
            stats,
            info_tx,
            events,
            phase: Phase::Idle,
            info: ConnectionInfo::default(),
            breaker,
            backoff,
            subscription_backoff,
            queue,
            generation: 0,
            ever_connected: false,
            online: true,
            waiters: Vec::new(),
            subscription_retries: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(url = %self.url, "Connection task started");

        loop {
            let next_subscription_retry = self.subscription_retries.iter().map(|(at, _)| *at).min();

            let event = match &mut self.phase {
                Phase::Idle => Event::Command(self.commands.recv().await),
                Phase::Waiting { until } => {
                    let until = *until;
                    tokio::select! {
                        biased;
                        cmd = self.commands.recv() => Event::Command(cmd),
                        _ = sleep_until_opt(until) => Event::RetryDue,
                    }
                }
                Phase::Connecting(handshake) => {
                    tokio::select! {
                        biased;
                        cmd = self.commands.recv() => Event::Command(cmd),
                        result = handshake => Event::Handshake(result),
                    }
                }
                Phase::Connected(link) => {
                    let pong_deadline = link.pong_deadline;
                    let next_ping = link.next_ping;
                    tokio::select! {
                        biased;
                        cmd = self.commands.recv() => Event::Command(cmd),
                        ev = link.conn.recv() => Event::Link(ev),
                        _ = sleep_until_opt(pong_deadline) => Event::PongOverdue,
                        _ = sleep_until(next_ping) => Event::PingDue,
                        _ = sleep_until_opt(next_subscription_retry) => Event::SubscriptionRetryDue,
                    }
                }
            };

            let keep_running = match event {
                Event::Command(None) => {
                    tracing::debug!("All client handles dropped");
                    self.stop().await;
                    false
                }
                Event::Command(Some(Command::Shutdown { reply })) => {
                    self.stop().await;
                    let _ = reply.send(());
                    false
                }
                Event::Command(Some(cmd)) => {
                    self.handle_command(cmd).await;
                    true
                }
                Event::RetryDue => {
                    self.on_retry_due();
                    true
                }
                Event::Handshake(result) => {
                    self.on_handshake(result).await;
                    true
                }
                Event::Link(ev) => {
                    self.on_link_event(ev).await;
                    true
                }
                Event::PingDue => {
                    self.on_ping_due().await;
                    true
                }
                Event::PongOverdue => {
                    self.on_pong_overdue().await;
                    true
                }
                Event::SubscriptionRetryDue => {
                    self.on_subscription_retry_due().await;
                    true
                }
            };

            if !keep_running {
                break;
            }
        }

        tracing::info!("Connection task stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => self.on_connect_requested(reply),
            Command::Disconnect => self.on_disconnect().await,
            Command::ForceReconnect => self.on_force_reconnect().await,
            Command::Send(message) => self.on_send(message).await,
            Command::Subscribe { channel } => {
                if self.is_connected() {
                    if let Some(options) = self.registry.claim_subscribe(&channel, self.generation) {
                        let frame = ClientFrame::subscribe(channel, Some(options));
                        self.write_control(&frame).await;
                    }
                }
            }
            Command::Unsubscribe {
                channel,
                sent_generation,
            } => {
                self.subscription_retries.retain(|(_, c)| *c != channel);
                if self.is_connected() && sent_generation == Some(self.generation) {
                    self.write_control(&ClientFrame::unsubscribe(channel)).await;
                }
            }
            Command::Resume(id) => {
                if let Some(resumed) = self.registry.take_resumed(id) {
                    let outcome = self.registry.deliver_resumed(resumed);
                    self.record_dispatch(outcome);
                }
            }
            Command::NetworkStatus(online) => self.on_network_status(online),
            Command::Shutdown { .. } => {}
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
    }

    // --- lifecycle -------------------------------------------------------

    fn on_connect_requested(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.info.degraded {
            let _ = reply.send(Err(self.degraded_error()));
            return;
        }

        match self.phase {
            Phase::Connected(_) => {
                let _ = reply.send(Ok(()));
            }
            Phase::Connecting(_) => self.waiters.push(reply),
            Phase::Waiting { .. } => {
                let now = Instant::now();
                if self.breaker.state_at(now) == CircuitState::Open {
                    let retry_in = self.breaker.remaining_cooldown(now);
                    self.emit(ConnectionEvent::ConnectRejected { retry_in });
                    let _ = reply.send(Err(RealtimeError::CircuitOpen { retry_in }));
                } else {
                    self.waiters.push(reply);
                }
            }
            Phase::Idle if !self.online => {
                self.hold_offline();
                self.waiters.push(reply);
            }
            Phase::Idle => match self.begin_attempt() {
                Ok(()) => self.waiters.push(reply),
                Err(retry_in) => {
                    let _ = reply.send(Err(RealtimeError::CircuitOpen { retry_in }));
                }
            },
        }
    }

    /// Start a dial if the breaker allows it; otherwise wait out the
    /// cooldown. Returns the refusal's remaining cooldown.
    fn begin_attempt(&mut self) -> std::result::Result<(), Duration> {
        let now = Instant::now();

        if let Err(retry_in) = self.breaker.try_acquire(now) {
            tracing::warn!(
                retry_in_ms = retry_in.as_millis() as u64,
                "Connection attempt refused by open circuit breaker"
            );
            self.phase = Phase::Waiting {
                until: Some(now + retry_in),
            };
            self.info.retry_scheduled = true;
            self.sync_circuit();
            self.publish();
            self.emit(ConnectionEvent::ConnectRejected { retry_in });
            return Err(retry_in);
        }

        if self.info.attempt > 0 {
            self.stats.record_reconnect_attempt();
        }
        tracing::info!(attempt = self.info.attempt, url = %self.url, "Connecting");

        let handshake = tokio::time::timeout(
            self.settings.connection_timeout(),
            establish(self.transport.clone(), self.url.clone(), self.stats.clone()),
        )
        .map(|result| result.unwrap_or(Err(TransportError::Timeout)))
        .boxed();

        self.phase = Phase::Connecting(handshake);
        self.info.state = ConnectionState::Connecting;
        self.info.retry_scheduled = false;
        self.sync_circuit();
        self.publish();
        self.emit(ConnectionEvent::Connecting {
            attempt: self.info.attempt,
        });
        Ok(())
    }

    fn on_retry_due(&mut self) {
        if !self.online {
            self.hold_offline();
            return;
        }
        // A refusal re-arms the wait by itself
        let _ = self.begin_attempt();
    }

    /// Park until the network comes back; `on_network_status` dials then.
    fn hold_offline(&mut self) {
        tracing::info!("Network offline, holding connection attempt until it comes back");
        self.phase = Phase::Waiting { until: None };
        self.info.state = ConnectionState::Disconnected;
        self.publish();
    }

    async fn on_handshake(&mut self, result: std::result::Result<Established, TransportError>) {
        match result {
            Ok(established) => self.on_connected(established).await,
            Err(e) if e.is_permanent() && !self.ever_connected => {
                tracing::error!(error = %e, url = %self.url, "Endpoint rejected the first connection");
                self.info.last_error = Some(e.to_string());
                self.emit(ConnectionEvent::Error {
                    message: e.to_string(),
                    recoverable: false,
                });
                self.degrade(format!("endpoint unavailable: {}", e));
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = self.info.attempt, "Connection attempt failed");
                self.info.state = ConnectionState::Disconnected;
                self.info.last_error = Some(e.to_string());
                self.emit(ConnectionEvent::Error {
                    message: e.to_string(),
                    recoverable: true,
                });
                self.schedule_retry();
            }
        }
    }

    async fn on_connected(&mut self, established: Established) {
        let Established {
            conn,
            connection_id,
        } = established;
        let now = Instant::now();

        self.generation += 1;
        self.ever_connected = true;
        self.breaker.record_success();
        self.info.attempt = 0;
        self.info.state = ConnectionState::Connected;
        self.info.connection_id = Some(connection_id.clone());
        self.info.last_connected_at = Some(Utc::now());
        self.info.retry_scheduled = false;
        self.info.degraded = false;
        self.info.last_error = None;
        self.phase = Phase::Connected(Link {
            conn,
            next_ping: now + self.settings.heartbeat_interval(),
            pong_deadline: None,
        });

        tracing::info!(
            connection_id = %connection_id,
            generation = self.generation,
            "Connected"
        );
        self.stats.record_connect();
        self.stats.touch_heartbeat();
        self.sync_circuit();
        self.publish();
        self.emit(ConnectionEvent::Connected {
            connection_id: connection_id.clone(),
        });

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        // Subscriptions first, then queued data
        for (channel, options) in self.registry.replay(self.generation) {
            let frame = ClientFrame::subscribe(channel, Some(options));
            if !self.write_control(&frame).await {
                return;
            }
        }
        self.drain_queue().await;
    }

    /// Record a failure against the breaker and schedule the next attempt.
    fn schedule_retry(&mut self) {
        let now = Instant::now();
        let delay = self.backoff.delay(self.info.attempt);
        let outcome = self.breaker.record_failure(now, delay);
        self.info.attempt = self.info.attempt.saturating_add(1);
        self.info.state = ConnectionState::Disconnected;
        self.sync_circuit();

        if outcome == FailureOutcome::Opened {
            self.emit(ConnectionEvent::CircuitOpened);
            let ceiling = self.settings.reconnection.max_open_cycles;
            if self.breaker.open_cycles() >= ceiling {
                self.degrade(format!(
                    "circuit breaker opened {} times without a successful connection",
                    ceiling
                ));
                return;
            }
        }

        tracing::info!(
            attempt = self.info.attempt,
            delay_ms = delay.as_millis() as u64,
            circuit = %self.breaker.state(),
            "Reconnect scheduled"
        );
        self.phase = Phase::Waiting {
            until: Some(now + delay),
        };
        self.info.retry_scheduled = true;
        self.publish();
        self.emit(ConnectionEvent::RetryScheduled {
            attempt: self.info.attempt,
            delay,
        });
    }

    fn degrade(&mut self, reason: String) {
        tracing::error!(reason = %reason, "Connection degraded, manual reconnect required");
        self.phase = Phase::Idle;
        self.info.state = ConnectionState::Disconnected;
        self.info.retry_scheduled = false;
        self.info.degraded = true;
        self.publish();
        self.emit(ConnectionEvent::Degraded {
            reason: reason.clone(),
        });

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(RealtimeError::Degraded {
                reason: reason.clone(),
            }));
        }
    }

    fn degraded_error(&self) -> RealtimeError {
        RealtimeError::Degraded {
            reason: self
                .info
                .last_error
                .clone()
                .unwrap_or_else(|| "retries exhausted".to_string()),
        }
    }

    /// The live link went away for a reason other than a manual disconnect.
    fn on_link_lost(&mut self, code: u16, reason: String, cause: &str) {
        tracing::warn!(code, reason = %reason, cause, "Connection lost");

        self.phase = Phase::Idle;
        self.info.state = ConnectionState::Disconnected;
        self.info.last_disconnected_at = Some(Utc::now());
        self.registry.deactivate_all();
        self.subscription_retries.clear();
        self.stats.record_disconnect(cause);

        if code != CLOSE_NORMAL {
            let message = format!("connection closed abnormally (code {}): {}", code, reason);
            self.info.last_error = Some(message.clone());
            self.emit(ConnectionEvent::Error {
                message,
                recoverable: true,
            });
        }
        self.emit(ConnectionEvent::Disconnected {
            code,
            reason,
            will_retry: true,
        });

        self.schedule_retry();
    }

    async fn on_disconnect(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        let was_connected = matches!(previous, Phase::Connected(_));
        if let Phase::Connected(mut link) = previous {
            link.conn.close(CLOSE_NORMAL, "client disconnect").await;
        }

        self.info.state = ConnectionState::Disconnected;
        self.info.attempt = 0;
        self.info.retry_scheduled = false;
        self.info.last_error = None;
        self.breaker.reset();
        self.registry.deactivate_all();
        self.subscription_retries.clear();
        self.sync_circuit();

        if was_connected {
            self.info.last_disconnected_at = Some(Utc::now());
            self.stats.record_disconnect("manual");
            self.emit(ConnectionEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: "client disconnect".to_string(),
                will_retry: false,
            });
        }
        tracing::info!("Disconnected by client");
        self.publish();

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(RealtimeError::Disconnected));
        }
    }

    async fn on_force_reconnect(&mut self) {
        tracing::info!("Forced reconnect requested");
        self.info.degraded = false;
        self.breaker.clear_open_cycles();

        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        if let Phase::Connecting(_) = previous {
            self.breaker.abandon_trial();
        }
        if let Phase::Connected(mut link) = previous {
            link.conn.close(CLOSE_NORMAL, "client reconnect").await;
            self.info.last_disconnected_at = Some(Utc::now());
            self.registry.deactivate_all();
            self.subscription_retries.clear();
            self.stats.record_disconnect("forced");
            self.emit(ConnectionEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: "client reconnect".to_string(),
                will_retry: true,
            });
        }

        // Pending retry timer or handshake in flight was dropped with the phase
        if !self.online {
            self.hold_offline();
            return;
        }
        let _ = self.begin_attempt();
    }

    fn on_network_status(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        self.stats.set_online(online);
        tracing::info!(online, "Network status changed");

        if online && matches!(self.phase, Phase::Waiting { .. }) {
            let _ = self.begin_attempt();
        }
    }

    async fn stop(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        if let Phase::Connected(mut link) = previous {
            link.conn.close(CLOSE_NORMAL, "client shutdown").await;
            self.stats.record_disconnect("manual");
            self.info.last_disconnected_at = Some(Utc::now());
        }

        self.info.state = ConnectionState::Disconnected;
        self.info.retry_scheduled = false;
        self.registry.deactivate_all();
        self.publish();

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(RealtimeError::Shutdown));
        }
    }

    // --- live link -------------------------------------------------------

    async fn on_link_event(
        &mut self,
        event: Option<std::result::Result<TransportEvent, TransportError>>,
    ) {
        match event {
            Some(Ok(TransportEvent::Text(text))) => {
                self.stats.record_received();
                self.on_frame(&text).await;
            }
            Some(Ok(TransportEvent::Closed { code, reason })) => {
                self.on_link_lost(code, reason, "closed");
            }
            Some(Err(e)) => {
                self.on_link_lost(CLOSE_ABNORMAL, e.to_string(), "error");
            }
            None => {
                self.on_link_lost(CLOSE_ABNORMAL, "connection dropped".to_string(), "error");
            }
        }
    }

    async fn on_frame(&mut self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.record_malformed();
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame {
            ServerFrame::Ping => {
                self.stats.touch_heartbeat();
                self.write_control(&ClientFrame::Pong).await;
            }
            ServerFrame::Pong => {
                self.stats.touch_heartbeat();
                if let Phase::Connected(link) = &mut self.phase {
                    link.pong_deadline = None;
                }
            }
            ServerFrame::ConnectionEstablished { connection_id, .. } => {
                tracing::debug!(connection_id = %connection_id, "Ignoring repeated handshake frame");
            }
            ServerFrame::SubscriptionResponse {
                channel,
                success: true,
                action,
                ..
            } => {
                if action == SubscriptionAction::Subscribe && self.registry.acknowledge(&channel) {
                    tracing::debug!(channel = %channel, "Subscription acknowledged");
                }
            }
            ServerFrame::SubscriptionResponse {
                channel, message, ..
            } => {
                let message = message.unwrap_or_else(|| "subscription rejected".to_string());
                self.on_subscription_rejected(channel, "SUBSCRIPTION_REJECTED".to_string(), message);
            }
            ServerFrame::Error {
                channel: Some(channel),
                code,
                message,
                ..
            } if self.registry.contains(&channel) => {
                self.on_subscription_rejected(channel, code, message);
            }
            ServerFrame::Error { code, message, .. } => {
                tracing::warn!(code = %code, message = %message, "Server reported an error");
                self.emit(ConnectionEvent::Error {
                    message: format!("{}: {}", code, message),
                    recoverable: true,
                });
            }
            ServerFrame::Data(message) => {
                tracing::debug!(channel = %message.channel, kind = %message.kind, "Data frame");
                let outcome = self.registry.dispatch(&message);
                self.record_dispatch(outcome);
            }
        }
    }

    fn on_subscription_rejected(&mut self, channel: String, code: String, message: String) {
        let max_retries = self.settings.subscription_retry.max_retries;
        let Some(rejection) = self.registry.reject(&channel, max_retries) else {
            tracing::debug!(channel = %channel, "Rejection for a channel nobody subscribes to");
            return;
        };

        let will_retry = rejection.retry_attempt.is_some();
        tracing::warn!(
            channel = %channel,
            code = %code,
            message = %message,
            will_retry,
            "Subscription rejected"
        );

        if let Some(attempt) = rejection.retry_attempt {
            let delay = self.subscription_backoff.delay(attempt - 1);
            self.subscription_retries
                .retain(|(_, pending)| *pending != channel);
            self.subscription_retries
                .push((Instant::now() + delay, channel.clone()));
        }

        let error = SubscriptionError {
            channel: channel.clone(),
            code,
            message: message.clone(),
            will_retry,
        };
        let panicked = self.registry.notify_rejection(&rejection, &error);
        for _ in 0..panicked {
            self.stats.record_handler_panic();
        }

        self.emit(ConnectionEvent::SubscriptionRejected { channel, message });
    }

    async fn on_subscription_retry_due(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscription_retries)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.subscription_retries = pending;

        for (_, channel) in due {
            if let Some(options) = self.registry.claim_retry(&channel, self.generation) {
                tracing::info!(channel = %channel, "Retrying subscription");
                if !self
                    .write_control(&ClientFrame::subscribe(channel, Some(options)))
                    .await
                {
                    return;
                }
            }
        }
    }

    async fn on_ping_due(&mut self) {
        let interval = self.settings.heartbeat_interval();
        let message_timeout = self.settings.message_timeout();
        let now = Instant::now();

        if let Phase::Connected(link) = &mut self.phase {
            link.next_ping = now + interval;
            if link.pong_deadline.is_none() {
                link.pong_deadline = Some(now + message_timeout);
            }
        }
        self.write_control(&ClientFrame::Ping).await;
    }

    async fn on_pong_overdue(&mut self) {
        tracing::warn!(
            timeout_ms = self.settings.message_timeout().as_millis() as u64,
            "No pong within message timeout"
        );
        self.emit(ConnectionEvent::HeartbeatTimeout);

        if let Phase::Connected(link) = &mut self.phase {
            link.conn
                .close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")
                .await;
        }
        self.on_link_lost(
            CLOSE_HEARTBEAT_TIMEOUT,
            "heartbeat timeout".to_string(),
            "heartbeat_timeout",
        );
    }

    // --- outbound --------------------------------------------------------

    /// Write a control frame; a failed write drops the link. Returns whether
    /// the link is still up.
    async fn write_control(&mut self, frame: &ClientFrame) -> bool {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode control frame");
                return self.is_connected();
            }
        };

        let Phase::Connected(link) = &mut self.phase else {
            return false;
        };
        match link.conn.send(text).await {
            Ok(()) => {
                self.stats.record_sent();
                true
            }
            Err(e) => {
                self.on_link_lost(CLOSE_ABNORMAL, e.to_string(), "error");
                false
            }
        }
    }

    async fn on_send(&mut self, message: QueuedMessage) {
        if !self.is_connected() {
            tracing::debug!(
                channel = %message.channel,
                priority = message.priority.as_str(),
                "Queueing message until connected"
            );
            self.enqueue(message);
            return;
        }

        // Anything queued goes first so a channel's sends stay in order
        if !self.queue.is_empty() {
            self.enqueue(message);
            self.drain_queue().await;
            return;
        }

        if let Err(message) = self.write_message(message).await {
            self.requeue_failed(message);
            self.on_link_lost(CLOSE_ABNORMAL, "write failed".to_string(), "error");
        }
    }

    fn enqueue(&mut self, message: QueuedMessage) {
        if self.queue.enqueue(message).is_some() {
            self.stats.record_dropped(DropReason::QueueFull);
        }
        self.stats.set_queue_depth(self.queue.depth());
    }

    /// Write one data message; gives the message back on failure.
    async fn write_message(
        &mut self,
        message: QueuedMessage,
    ) -> std::result::Result<(), QueuedMessage> {
        let text = match encode_message(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, channel = %message.channel, "Dropping unencodable message");
                return Ok(());
            }
        };

        let Phase::Connected(link) = &mut self.phase else {
            return Err(message);
        };
        match link.conn.send(text).await {
            Ok(()) => {
                self.stats.record_sent();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, channel = %message.channel, "Write failed");
                Err(message)
            }
        }
    }

    fn requeue_failed(&mut self, mut message: QueuedMessage) {
        message.retries += 1;
        if message.retries > self.settings.queue.max_send_retries {
            tracing::warn!(
                channel = %message.channel,
                retries = message.retries,
                "Dropping message after repeated write failures"
            );
            self.stats.record_dropped(DropReason::SendRetries);
        } else if self.queue.requeue_front(message).is_some() {
            self.stats.record_dropped(DropReason::QueueFull);
        }
        self.stats.set_queue_depth(self.queue.depth());
    }

    /// Flush the queue high -> normal -> low, stopping at the first failed
    /// write.
    async fn drain_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        tracing::info!(queued = self.queue.len(), "Draining queued messages");

        loop {
            let Some(message) = self.queue.drain_in_priority_order().next() else {
                break;
            };
            if let Err(message) = self.write_message(message).await {
                self.requeue_failed(message);
                self.on_link_lost(CLOSE_ABNORMAL, "write failed".to_string(), "error");
                return;
            }
        }
        self.stats.set_queue_depth(self.queue.depth());
    }

    // --- bookkeeping -----------------------------------------------------

    fn record_dispatch(&self, outcome: DispatchOutcome) {
        for _ in 0..outcome.panicked {
            self.stats.record_handler_panic();
        }
        for _ in 0..outcome.dropped {
            self.stats.record_dropped(DropReason::Paused);
        }
    }

    fn sync_circuit(&self) {
        self.stats.set_circuit(self.breaker.stats());
    }

    fn publish(&self) {
        self.stats.set_state(self.info.state, self.info.degraded);
        self.info_tx.send_replace(self.info.clone());
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

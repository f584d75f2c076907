use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::config::Settings;
use crate::error::{RealtimeError, Result};
use crate::protocol::ChannelMessage;
use crate::queue::{Priority, QueuedMessage};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::subscription::{
    validate_channel, SubscriptionControl, SubscriptionHandle, SubscriptionId, SubscriptionInfo,
    SubscriptionOptions, SubscriptionRegistry,
};
use crate::transport::Transport;

use super::manager::{Command, ConnectionTask};
use super::state::{ConnectionEvent, ConnectionInfo, ConnectionStatus};

/// Capacity of the lifecycle event channel; slow receivers lag, never block
const EVENT_CAPACITY: usize = 256;

struct ClientShared {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<StatsCollector>,
    info: watch::Receiver<ConnectionInfo>,
    events: broadcast::Sender<ConnectionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientShared {
    fn command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| RealtimeError::Shutdown)
    }
}

impl SubscriptionControl for ClientShared {
    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(removal) = self.registry.remove(id) {
            if removal.emptied {
                let _ = self.commands.send(Command::Unsubscribe {
                    channel: removal.channel,
                    sent_generation: removal.sent_generation,
                });
            }
        }
    }

    fn pause(&self, id: SubscriptionId) {
        self.registry.pause(id);
    }

    fn resume(&self, id: SubscriptionId) {
        // Delivered on the connection task so buffered messages stay ahead
        // of new arrivals
        let _ = self.commands.send(Command::Resume(id));
    }
}

/// Handle to the shared realtime connection.
///
/// Cheap to clone; every clone drives the same connection task. The task
/// stops on [`shutdown`](Self::shutdown) or when the last clone is dropped.
#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<ClientShared>,
}

impl RealtimeClient {
    /// Validate `settings` and spawn the connection task. Does not dial.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(settings: Settings, transport: Arc<dyn Transport>) -> Result<Self> {
        settings.validate()?;
        let url = settings.endpoint_url()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = watch::channel(ConnectionInfo::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(StatsCollector::new());

        tracing::info!(
            url = %url,
            client_id = %settings.connection.client_id,
            user_id = settings.connection.user_id.as_deref().unwrap_or("-"),
            "Initializing realtime client"
        );

        let task = ConnectionTask::new(
            settings,
            url,
            transport,
            command_rx,
            registry.clone(),
            stats.clone(),
            info_tx,
            events.clone(),
        );
        let handle = tokio::spawn(task.run());

        Ok(Self {
            shared: Arc::new(ClientShared {
                commands,
                registry,
                stats,
                info: info_rx,
                events,
                task: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Connect, resolving once the handshake completes.
    ///
    /// Fails fast with [`RealtimeError::CircuitOpen`] while the breaker is
    /// open. Transient failures are retried in the background and keep this
    /// future pending; it resolves with [`RealtimeError::Degraded`] once
    /// retries are exhausted.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.shared.command(Command::Connect { reply })?;
        rx.await.map_err(|_| RealtimeError::Shutdown)?
    }

    /// Close the connection and stop retrying.
    pub fn disconnect(&self) -> Result<()> {
        self.shared.command(Command::Disconnect)
    }

    /// Cancel any pending retry and attempt a fresh connection now. Also
    /// clears the degraded flag.
    pub fn force_reconnect(&self) -> Result<()> {
        self.shared.command(Command::ForceReconnect)
    }

    pub fn set_network_online(&self, online: bool) -> Result<()> {
        self.shared.command(Command::NetworkStatus(online))
    }

    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.subscribe_with(channel, handler, SubscriptionOptions::default())
    }

    /// Register `handler` on `channel`. The subscribe frame goes out now if
    /// connected, otherwise on the next successful connect.
    pub fn subscribe_with<F>(
        &self,
        channel: &str,
        handler: F,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        if self.shared.commands.is_closed() {
            return Err(RealtimeError::Shutdown);
        }

        let registration = self.shared.registry.add(channel, Arc::new(handler), options)?;
        if registration.new_channel {
            self.shared.command(Command::Subscribe {
                channel: channel.to_string(),
            })?;
        }

        let shared: Arc<dyn SubscriptionControl> = self.shared.clone();
        Ok(SubscriptionHandle::new(
            registration.id,
            channel.to_string(),
            Arc::downgrade(&shared),
        ))
    }

    /// Remove one handler by id.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        SubscriptionControl::unsubscribe(self.shared.as_ref(), id);
    }

    /// Send a data frame at the channel's subscription priority (normal if
    /// nobody subscribes to it).
    pub fn send(&self, channel: &str, kind: &str, data: Value) -> Result<()> {
        let priority = self.shared.registry.priority_for(channel).unwrap_or_default();
        self.send_with_priority(channel, kind, data, priority)
    }

    /// Send a data frame, queueing it at `priority` while disconnected.
    pub fn send_with_priority(
        &self,
        channel: &str,
        kind: &str,
        data: Value,
        priority: Priority,
    ) -> Result<()> {
        validate_channel(channel)?;
        self.shared
            .command(Command::Send(QueuedMessage::new(channel, kind, data, priority)))
    }

    pub fn info(&self) -> ConnectionInfo {
        self.shared.info.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.info.borrow().status()
    }

    /// Stream of connection snapshots, starting with the current one.
    pub fn state_changes(&self) -> WatchStream<ConnectionInfo> {
        WatchStream::new(self.shared.info.clone())
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.shared.registry.len())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.shared.registry.info()
    }

    /// Stop the connection task and close the transport. Later calls fail
    /// with [`RealtimeError::Shutdown`].
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.shared.command(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }

        let handle = self
            .shared
            .task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Connection task ended abnormally");
            }
        }
    }
}

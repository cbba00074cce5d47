//! The connection registry.
//!
//! A [`Hub`] is a cheap, cloneable handle. All mutations travel through one
//! ordered event queue to a single [`Dispatcher`] task, which owns every
//! write to the user → connections map. Read queries take the shared side
//! of the same lock and never observe a half-applied mutation.
//!
//! Presence writes and broker publishes are handed to a separate effects
//! task over a bounded queue, so a slow store or broker never stalls
//! delivery. When that queue is full the side effect is dropped; presence
//! entries recover on the next refresh or expire with their TTL.
//!
//! ```text
//!  register / unregister / broadcast ──▶ event queue ──▶ Dispatcher ──▶ outbound queues
//!                                             ▲               │
//!                                    Relay ◀── broker         ▼
//!                                                        effects task ──▶ presence store, broker
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tether_protocol::{codec, Message, PresenceStatus};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::Broker;
use crate::client::{Client, ClientInfo, Delivery, Outbound, DEFAULT_CLIENT_BUFFER};
use crate::presence::{PresenceAdapter, PresenceMetadata, PresenceStore, DEFAULT_PRESENCE_TTL};
use crate::relay::Relay;

/// Broker topic shared by every process of the fleet.
pub const DEFAULT_BROADCAST_TOPIC: &str = "websocket:broadcast";

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the ordered event queue.
    pub event_queue_capacity: usize,
    /// Outbound queue capacity of connections created by [`Hub::client`].
    pub client_buffer: usize,
    /// Broker topic used for cross-process fan-out.
    pub broadcast_topic: String,
    /// TTL of presence entries.
    pub presence_ttl: Duration,
    /// Interval at which live connections re-write their presence entry.
    pub presence_refresh: Duration,
    /// Upper bound on a single presence-store or broker call.
    pub effect_timeout: Duration,
    /// Capacity of the side-effects queue.
    pub effect_queue_capacity: usize,
    /// How long shutdown waits for queued side effects before abandoning them.
    pub shutdown_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 256,
            client_buffer: DEFAULT_CLIENT_BUFFER,
            broadcast_topic: DEFAULT_BROADCAST_TOPIC.to_string(),
            presence_ttl: DEFAULT_PRESENCE_TTL,
            presence_refresh: Duration::from_secs(30),
            effect_timeout: Duration::from_secs(2),
            effect_queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubSnapshot {
    pub total_users: usize,
    pub total_connections: usize,
    pub user_connections: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct DeliveryReport {
    recipients: usize,
    queued: usize,
    dropped: usize,
}

type Registry = HashMap<String, Vec<Client>>;

fn connection_count(registry: &Registry) -> usize {
    registry.values().map(Vec::len).sum()
}

enum HubEvent {
    Register(Client),
    Unregister(Arc<ClientInfo>),
    Broadcast(Arc<Message>),
    Publish(Arc<Message>),
    Sync(oneshot::Sender<()>),
}

impl HubEvent {
    fn name(&self) -> &'static str {
        match self {
            HubEvent::Register(_) => "register",
            HubEvent::Unregister(_) => "unregister",
            HubEvent::Broadcast(_) => "broadcast",
            HubEvent::Publish(_) => "publish",
            HubEvent::Sync(_) => "sync",
        }
    }
}

struct PresenceWrite {
    user_id: String,
    client_id: String,
    metadata: PresenceMetadata,
}

impl From<&ClientInfo> for PresenceWrite {
    fn from(info: &ClientInfo) -> Self {
        Self {
            user_id: info.user_id.clone(),
            client_id: info.id.to_string(),
            metadata: PresenceMetadata::from(info),
        }
    }
}

enum Effect {
    SetPresence(PresenceWrite),
    RemovePresence { user_id: String, client_id: String },
    RefreshPresence(Vec<PresenceWrite>),
    Publish(Arc<Message>),
    Sync(oneshot::Sender<()>),
}

impl Effect {
    fn name(&self) -> &'static str {
        match self {
            Effect::SetPresence(_) => "set_presence",
            Effect::RemovePresence { .. } => "remove_presence",
            Effect::RefreshPresence(_) => "refresh_presence",
            Effect::Publish(_) => "publish",
            Effect::Sync(_) => "sync",
        }
    }
}

/// Dispatcher side of the side-effects queue.
struct Effects {
    tx: mpsc::Sender<Effect>,
    /// Set while a refresh batch is queued or running.
    refresh_pending: Arc<AtomicBool>,
}

impl Effects {
    /// Queue an effect without waiting. Returns `false` if it was dropped.
    fn push(&self, effect: Effect) -> bool {
        match self.tx.try_send(effect) {
            Ok(()) => true,
            Err(TrySendError::Full(effect)) => {
                crate::metrics::record_effect_dropped(effect.name());
                warn!(
                    effect = effect.name(),
                    capacity = self.tx.max_capacity(),
                    "Effects queue full, side effect dropped"
                );
                false
            }
            Err(TrySendError::Closed(effect)) => {
                debug!(effect = effect.name(), "Effects task stopped, side effect dropped");
                false
            }
        }
    }
}

/// Handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    events: mpsc::Sender<HubEvent>,
    registry: Arc<RwLock<Registry>>,
    config: Arc<HubConfig>,
}

impl Hub {
    /// Create a hub and the dispatcher that drives it.
    ///
    /// Nothing happens until [`Dispatcher::run`] is awaited (usually on a
    /// spawned task); events submitted before that wait in the queue.
    #[must_use]
    pub fn new(
        config: HubConfig,
        presence: Arc<dyn PresenceStore>,
        broker: Arc<dyn Broker>,
    ) -> (Self, Dispatcher) {
        info!("Creating hub with config: {:?}", config);

        let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let registry = Arc::new(RwLock::new(Registry::new()));
        let config = Arc::new(config);

        let hub = Self {
            events: tx,
            registry: Arc::clone(&registry),
            config: Arc::clone(&config),
        };
        let presence = PresenceAdapter::new(presence, config.presence_ttl, config.effect_timeout);
        let dispatcher = Dispatcher {
            events: rx,
            registry,
            config,
            presence,
            broker,
            relay_hub: hub.clone(),
        };

        (hub, dispatcher)
    }

    /// Get the hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create a connection pair sized by the configured client buffer.
    #[must_use]
    pub fn client(
        &self,
        user_id: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> (Client, Outbound) {
        Client::new(user_id, user_agent, self.config.client_buffer)
    }

    /// Check if the dispatcher still accepts events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    /// Register a connection.
    ///
    /// After shutdown the registration is ignored and the connection's
    /// outbound queue is closed.
    pub async fn register(&self, client: Client) {
        self.submit(HubEvent::Register(client)).await;
    }

    /// Unregister a connection. Unknown connections are ignored.
    pub async fn unregister(&self, client: Arc<ClientInfo>) {
        self.submit(HubEvent::Unregister(client)).await;
    }

    /// Deliver a message to local connections, honouring its target.
    pub async fn broadcast(&self, message: Message) {
        self.submit(HubEvent::Broadcast(Arc::new(message))).await;
    }

    /// Deliver a message to every local connection of one user.
    ///
    /// An empty `user_id` is ignored rather than treated as "no target".
    pub async fn send_to_user(&self, user_id: &str, message: Message) {
        if user_id.is_empty() {
            warn!(kind = %message.kind(), "SendToUser called without a user ID, message ignored");
            return;
        }
        debug!(user_id = %user_id, kind = %message.kind(), "SendToUser called");
        self.broadcast(message.with_target(user_id)).await;
    }

    /// Deliver a message to every local connection.
    pub async fn broadcast_to_all(&self, message: Message) {
        debug!(kind = %message.kind(), "BroadcastToAll called");
        self.broadcast(message.without_target()).await;
    }

    /// Publish a message to the broker topic for fleet-wide delivery.
    ///
    /// Local delivery happens when the relay receives the message back.
    pub async fn publish(&self, message: Message) {
        self.submit(HubEvent::Publish(Arc::new(message))).await;
    }

    /// Wait until every event queued before this call, and the side effects
    /// it produced, has been applied.
    ///
    /// Returns early when the side-effects queue is full, and immediately
    /// once the hub has shut down.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.submit(HubEvent::Sync(tx)).await {
            let _ = rx.await;
        }
    }

    /// Number of users with at least one local connection.
    pub async fn connected_user_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Number of local connections across all users.
    pub async fn total_connection_count(&self) -> usize {
        connection_count(&*self.registry.read().await)
    }

    /// Check if a user has at least one local connection.
    pub async fn is_user_connected(&self, user_id: &str) -> bool {
        self.registry
            .read()
            .await
            .get(user_id)
            .is_some_and(|devices| !devices.is_empty())
    }

    /// Number of local connections of one user.
    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.registry
            .read()
            .await
            .get(user_id)
            .map_or(0, Vec::len)
    }

    /// IDs of users with at least one local connection, sorted.
    pub async fn online_user_ids(&self) -> Vec<String> {
        let mut users: Vec<String> = self.registry.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// Consistent snapshot of the registry for debugging.
    pub async fn snapshot(&self) -> HubSnapshot {
        let registry = self.registry.read().await;
        let user_connections: BTreeMap<String, usize> = registry
            .iter()
            .map(|(user_id, devices)| (user_id.clone(), devices.len()))
            .collect();
        let snapshot = HubSnapshot {
            total_users: registry.len(),
            total_connections: connection_count(&registry),
            user_connections,
        };
        trace!(?snapshot, "Hub snapshot");
        snapshot
    }

    async fn submit(&self, event: HubEvent) -> bool {
        match self.events.send(event).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                // Dropping a rejected registration closes its outbound queue.
                debug!(event = event.name(), "Hub is not running, event ignored");
                false
            }
        }
    }
}

/// The single writer of the registry.
pub struct Dispatcher {
    events: mpsc::Receiver<HubEvent>,
    registry: Arc<RwLock<Registry>>,
    config: Arc<HubConfig>,
    presence: PresenceAdapter,
    broker: Arc<dyn Broker>,
    relay_hub: Hub,
}

impl Dispatcher {
    /// Run the dispatch loop until `cancel` fires.
    ///
    /// Subscribes to the broker topic and starts the relay and effects
    /// tasks first. On cancellation every registered outbound queue is
    /// closed, the registry is cleared and the subscription is released.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Hub starting");

        let (effects_tx, effects_rx) = mpsc::channel(self.config.effect_queue_capacity.max(1));
        let effects = Effects {
            tx: effects_tx,
            refresh_pending: Arc::new(AtomicBool::new(false)),
        };
        let worker = EffectWorker {
            presence: self.presence.clone(),
            broker: Arc::clone(&self.broker),
            topic: self.config.broadcast_topic.clone(),
            timeout: self.config.effect_timeout,
            refresh_budget: self.config.presence_refresh.max(Duration::from_millis(100)),
            refresh_pending: Arc::clone(&effects.refresh_pending),
        };
        let mut effects_task = tokio::spawn(worker.run(effects_rx));

        let topic = self.config.broadcast_topic.clone();
        let relay_task = match self.broker.subscribe(&topic).await {
            Ok(subscription) => {
                info!(topic = %topic, "Broker subscription active");
                let relay = Relay::new(subscription, self.relay_hub.clone(), topic.clone());
                Some(tokio::spawn(relay.run(cancel.clone())))
            }
            Err(e) => {
                crate::metrics::record_broker_error("subscribe");
                error!(topic = %topic, error = %e, "Broker subscribe failed, cross-process relay disabled");
                None
            }
        };

        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.presence_refresh,
            self.config.presence_refresh.max(Duration::from_millis(100)),
        );
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Hub dispatch loop running");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event, &effects).await,
                    None => break,
                },
                _ = refresh.tick() => self.refresh_presence(&effects).await,
            }
        }

        info!("Hub shutting down");
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            debug!(event = event.name(), "Discarding event queued during shutdown");
        }
        self.close_all(&effects).await;

        drop(effects);
        if let Some(task) = relay_task {
            if let Err(e) = task.await {
                error!(error = %e, "Relay task failed");
            }
        }
        match tokio::time::timeout(self.config.shutdown_timeout, &mut effects_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Effects task failed"),
            Err(_) => {
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "Side effects still pending at shutdown deadline, abandoning them"
                );
                effects_task.abort();
            }
        }
        info!("Hub stopped");
    }

    async fn handle(&self, event: HubEvent, effects: &Effects) {
        match event {
            HubEvent::Register(client) => self.register(client, effects).await,
            HubEvent::Unregister(info) => self.unregister(&info, effects).await,
            HubEvent::Broadcast(message) => {
                self.deliver(&message).await;
            }
            HubEvent::Publish(message) => {
                debug!(kind = %message.kind(), "Publishing to broker");
                effects.push(Effect::Publish(message));
            }
            HubEvent::Sync(done) => {
                // A dropped barrier resolves the waiter early.
                effects.push(Effect::Sync(done));
            }
        }
    }

    async fn register(&self, client: Client, effects: &Effects) {
        let info = Arc::clone(client.info());

        let (device_count, total_users, total_connections) = {
            let mut registry = self.registry.write().await;
            let devices = registry.entry(info.user_id.clone()).or_default();
            if devices.iter().any(|c| c.id() == &info.id) {
                warn!(
                    user_id = %info.user_id,
                    client_id = %info.id,
                    "Duplicate registration ignored"
                );
                return;
            }
            devices.push(client);
            let device_count = devices.len();
            (device_count, registry.len(), connection_count(&registry))
        };

        crate::metrics::set_registry_size(total_users, total_connections);
        info!(
            user_id = %info.user_id,
            client_id = %info.id,
            device_count,
            user_agent = %info.user_agent,
            total_users,
            total_connections,
            "Client registered"
        );

        effects.push(Effect::SetPresence(PresenceWrite::from(&*info)));

        if device_count == 1 {
            info!(user_id = %info.user_id, "User came online");
            self.emit_presence(&info.user_id, PresenceStatus::Online, effects)
                .await;
        } else {
            debug!(user_id = %info.user_id, device_count, "Additional device connected");
        }
    }

    async fn unregister(&self, info: &ClientInfo, effects: &Effects) {
        let removed = {
            let mut registry = self.registry.write().await;
            let Some(devices) = registry.get_mut(&info.user_id) else {
                warn!(user_id = %info.user_id, client_id = %info.id, "Attempted to unregister unknown client");
                return;
            };
            let Some(position) = devices.iter().position(|c| c.id() == &info.id) else {
                warn!(user_id = %info.user_id, client_id = %info.id, "Attempted to unregister unknown client");
                return;
            };

            // Dropping the handle closes the outbound queue.
            drop(devices.remove(position));
            let remaining = devices.len();
            if remaining == 0 {
                registry.remove(&info.user_id);
            }
            (remaining, registry.len(), connection_count(&registry))
        };
        let (remaining, total_users, total_connections) = removed;

        crate::metrics::set_registry_size(total_users, total_connections);
        effects.push(Effect::RemovePresence {
            user_id: info.user_id.clone(),
            client_id: info.id.to_string(),
        });

        if remaining == 0 {
            info!(
                user_id = %info.user_id,
                client_id = %info.id,
                total_users,
                total_connections,
                "Client unregistered, user offline"
            );
            self.emit_presence(&info.user_id, PresenceStatus::Offline, effects)
                .await;
        } else {
            info!(
                user_id = %info.user_id,
                client_id = %info.id,
                remaining_devices = remaining,
                "Client unregistered, user still online"
            );
        }
    }

    async fn emit_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        effects: &Effects,
    ) {
        crate::metrics::record_presence_transition(match status {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        });
        let message = Arc::new(Message::presence(user_id, status));
        self.deliver(&message).await;
        effects.push(Effect::Publish(message));
    }

    async fn deliver(&self, message: &Arc<Message>) {
        let registry = self.registry.read().await;
        let mut report = DeliveryReport::default();

        match message.target_user_id() {
            Some(user_id) => match registry.get(user_id) {
                Some(devices) => {
                    for client in devices {
                        Self::deliver_one(client, message, &mut report);
                    }
                }
                None => {
                    debug!(
                        target_user_id = %user_id,
                        kind = %message.kind(),
                        online_users = registry.len(),
                        "Target user not connected"
                    );
                }
            },
            None => {
                for client in registry.values().flatten() {
                    Self::deliver_one(client, message, &mut report);
                }
            }
        }

        crate::metrics::record_delivered(report.queued);
        debug!(
            kind = %message.kind(),
            target_user_id = message.target_user_id().unwrap_or(""),
            recipients = report.recipients,
            queued = report.queued,
            dropped = report.dropped,
            "Delivery summary"
        );
    }

    fn deliver_one(client: &Client, message: &Arc<Message>, report: &mut DeliveryReport) {
        report.recipients += 1;
        match client.try_deliver(message) {
            Delivery::Queued => report.queued += 1,
            Delivery::Full => {
                report.dropped += 1;
                crate::metrics::record_dropped("full");
                warn!(
                    user_id = %client.user_id(),
                    client_id = %client.id(),
                    kind = %message.kind(),
                    buffer = client.capacity(),
                    "Client send buffer full, message dropped"
                );
            }
            Delivery::Closed => {
                report.dropped += 1;
                crate::metrics::record_dropped("closed");
                debug!(
                    user_id = %client.user_id(),
                    client_id = %client.id(),
                    "Client writer gone, message dropped"
                );
            }
        }
    }

    async fn refresh_presence(&self, effects: &Effects) {
        if effects.refresh_pending.load(Ordering::Acquire) {
            crate::metrics::record_effect_dropped("refresh_presence");
            warn!("Previous presence refresh still running, skipping this one");
            return;
        }

        let writes: Vec<PresenceWrite> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .flatten()
                .map(|client| PresenceWrite::from(&**client.info()))
                .collect()
        };
        if writes.is_empty() {
            return;
        }

        let connections = writes.len();
        effects.refresh_pending.store(true, Ordering::Release);
        if effects.push(Effect::RefreshPresence(writes)) {
            trace!(connections, "Presence refresh queued");
        } else {
            effects.refresh_pending.store(false, Ordering::Release);
        }
    }

    async fn close_all(&self, effects: &Effects) {
        let mut registry = self.registry.write().await;
        let total_users = registry.len();
        let total_connections = connection_count(&registry);

        for (user_id, devices) in registry.drain() {
            for client in devices {
                effects.push(Effect::RemovePresence {
                    user_id: user_id.clone(),
                    client_id: client.id().to_string(),
                });
                debug!(user_id = %user_id, client_id = %client.id(), "Closed client connection");
            }
        }

        crate::metrics::set_registry_size(0, 0);
        info!(total_users, total_connections, "All connections closed");
    }
}

/// Applies presence writes and broker publishes in queue order.
struct EffectWorker {
    presence: PresenceAdapter,
    broker: Arc<dyn Broker>,
    topic: String,
    timeout: Duration,
    /// Upper bound on one refresh batch.
    refresh_budget: Duration,
    refresh_pending: Arc<AtomicBool>,
}

impl EffectWorker {
    async fn run(self, mut effects: mpsc::Receiver<Effect>) {
        while let Some(effect) = effects.recv().await {
            match effect {
                Effect::SetPresence(write) => self.set_presence(&write).await,
                Effect::RemovePresence { user_id, client_id } => {
                    self.presence.remove_presence(&user_id, &client_id).await;
                }
                Effect::RefreshPresence(writes) => {
                    self.refresh(&writes).await;
                    self.refresh_pending.store(false, Ordering::Release);
                }
                Effect::Publish(message) => self.publish(&message).await,
                Effect::Sync(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Effects task stopped");
    }

    async fn set_presence(&self, write: &PresenceWrite) {
        self.presence
            .set_presence(&write.user_id, &write.client_id, &write.metadata)
            .await;
    }

    async fn refresh(&self, writes: &[PresenceWrite]) {
        let batch = async {
            for write in writes {
                self.set_presence(write).await;
            }
        };
        if tokio::time::timeout(self.refresh_budget, batch).await.is_err() {
            crate::metrics::record_effect_dropped("refresh_presence");
            warn!(
                connections = writes.len(),
                budget = ?self.refresh_budget,
                "Presence refresh did not finish in time, remaining entries skipped"
            );
        }
    }

    async fn publish(&self, message: &Message) {
        let payload = match codec::encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %message.kind(), error = %e, "Failed to encode message for broker");
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.broker.publish(&self.topic, payload)).await {
            Ok(Ok(())) => {
                debug!(topic = %self.topic, kind = %message.kind(), "Published to broker");
            }
            Ok(Err(e)) => {
                crate::metrics::record_broker_error("publish");
                error!(topic = %self.topic, kind = %message.kind(), error = %e, "Broker publish failed");
            }
            Err(_) => {
                crate::metrics::record_broker_error("publish");
                warn!(topic = %self.topic, kind = %message.kind(), timeout = ?self.timeout, "Broker publish timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, Subscription};
    use crate::presence::{MemoryPresenceStore, PresenceError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;
    use tether_protocol::MessageType;
    use tokio::time::Instant;

    /// Broker that records publishes and never delivers anything back.
    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<Message>>,
    }

    impl RecordingBroker {
        fn published(&self) -> Vec<Message> {
            self.published.lock().unwrap().clone()
        }

        fn count(&self, kind: &MessageType) -> usize {
            self.published().iter().filter(|m| m.kind() == kind).count()
        }
    }

    struct Silent;

    #[async_trait]
    impl Subscription for Silent {
        async fn recv(&mut self) -> Result<Option<Bytes>, BrokerError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn publish(&self, _topic: &str, payload: Bytes) -> Result<(), BrokerError> {
            let message = codec::decode(&payload).unwrap();
            self.published.lock().unwrap().push(message);
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> Result<Box<dyn Subscription>, BrokerError> {
            Ok(Box::new(Silent))
        }
    }

    /// Presence store whose writes never complete.
    struct HangingStore;

    #[async_trait]
    impl PresenceStore for HangingStore {
        async fn set(
            &self,
            _user_id: &str,
            _client_id: &str,
            _metadata: &PresenceMetadata,
            _ttl: Duration,
        ) -> Result<(), PresenceError> {
            std::future::pending().await
        }

        async fn remove(&self, _user_id: &str, _client_id: &str) -> Result<(), PresenceError> {
            std::future::pending().await
        }

        async fn is_online(&self, _user_id: &str) -> Result<bool, PresenceError> {
            Ok(false)
        }

        async fn online_users(&self) -> Result<Vec<String>, PresenceError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        hub: Hub,
        broker: Arc<RecordingBroker>,
        presence: MemoryPresenceStore,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Fixture {
        let broker = Arc::new(RecordingBroker::default());
        let presence = MemoryPresenceStore::new();
        let (hub, dispatcher) = Hub::new(
            HubConfig::default(),
            Arc::new(presence.clone()),
            broker.clone(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(cancel.clone()));
        Fixture {
            hub,
            broker,
            presence,
            cancel,
            task,
        }
    }

    fn kinds(outbound: &mut Outbound) -> Vec<MessageType> {
        outbound.drain().iter().map(|m| m.kind().clone()).collect()
    }

    #[tokio::test]
    async fn test_first_connection_goes_online() {
        let f = start();
        let (client, mut outbound) = f.hub.client("A", "phone");
        let info = Arc::clone(client.info());

        f.hub.register(client).await;
        f.hub.sync().await;

        assert!(f.hub.is_user_connected("A").await);
        assert_eq!(f.hub.user_connection_count("A").await, 1);
        assert_eq!(f.broker.count(&MessageType::UserOnline), 1);
        assert_eq!(kinds(&mut outbound), vec![MessageType::UserOnline]);

        let stored = f.presence.get("A", info.id.as_str()).unwrap();
        assert_eq!(stored.user_agent, "phone");
    }

    #[tokio::test]
    async fn test_second_device_emits_nothing() {
        let f = start();
        let (c1, mut o1) = f.hub.client("A", "phone");
        let (c2, mut o2) = f.hub.client("A", "laptop");

        f.hub.register(c1).await;
        f.hub.register(c2).await;
        f.hub.sync().await;

        assert_eq!(f.hub.user_connection_count("A").await, 2);
        assert_eq!(f.hub.connected_user_count().await, 1);
        assert_eq!(f.broker.count(&MessageType::UserOnline), 1);
        assert_eq!(kinds(&mut o1), vec![MessageType::UserOnline]);
        assert!(o2.drain().is_empty());
        assert_eq!(f.presence.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_non_last_unregister_keeps_user_online() {
        let f = start();
        let (c1, mut o1) = f.hub.client("A", "phone");
        let (c2, _o2) = f.hub.client("A", "laptop");
        let info1 = Arc::clone(c1.info());

        f.hub.register(c1).await;
        f.hub.register(c2).await;
        f.hub.unregister(info1.clone()).await;
        f.hub.sync().await;

        assert_eq!(f.hub.user_connection_count("A").await, 1);
        assert!(f.hub.is_user_connected("A").await);
        assert_eq!(f.broker.count(&MessageType::UserOffline), 0);
        assert!(f.presence.get("A", info1.id.as_str()).is_none());
        assert_eq!(f.presence.entry_count(), 1);

        // The removed connection's queue is closed after its backlog
        assert_eq!(kinds(&mut o1), vec![MessageType::UserOnline]);
        assert!(o1.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_online_then_offline_exactly_once() {
        let f = start();
        let (observer, mut observed) = f.hub.client("observer", "ua");
        f.hub.register(observer).await;
        f.hub.sync().await;
        observed.drain();

        let (client, _outbound) = f.hub.client("A", "phone");
        let info = Arc::clone(client.info());
        f.hub.register(client).await;
        f.hub.unregister(info).await;
        f.hub.sync().await;

        assert_eq!(f.hub.connected_user_count().await, 1);
        assert!(!f.hub.is_user_connected("A").await);

        let presence: Vec<_> = f
            .broker
            .published()
            .into_iter()
            .filter(|m| m.presence_payload().is_some_and(|p| p.user_id == "A"))
            .map(|m| m.kind().clone())
            .collect();
        assert_eq!(presence, vec![MessageType::UserOnline, MessageType::UserOffline]);
        assert_eq!(
            kinds(&mut observed),
            vec![MessageType::UserOnline, MessageType::UserOffline]
        );
        assert!(!f.presence.is_online("A").await.unwrap());
    }

    #[tokio::test]
    async fn test_send_to_offline_user_is_noop() {
        let f = start();
        let (client, mut outbound) = f.hub.client("A", "ua");
        f.hub.register(client).await;
        f.hub.sync().await;
        outbound.drain();

        f.hub
            .send_to_user("B", Message::new("chat", json!({"text": "hi"})))
            .await;
        f.hub.sync().await;

        assert!(outbound.drain().is_empty());
        assert_eq!(f.hub.total_connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_targeted_and_untargeted_delivery() {
        let f = start();
        let (a1, mut oa1) = f.hub.client("A", "ua");
        let (a2, mut oa2) = f.hub.client("A", "ua");
        let (b1, mut ob1) = f.hub.client("B", "ua");
        for client in [a1, a2, b1] {
            f.hub.register(client).await;
        }
        f.hub.sync().await;
        for outbound in [&mut oa1, &mut oa2, &mut ob1] {
            outbound.drain();
        }

        f.hub
            .send_to_user("A", Message::new("ride_update", json!({"eta": 3})))
            .await;
        f.hub
            .broadcast_to_all(Message::new("announcement", json!("hello")).with_target("B"))
            .await;
        f.hub.sync().await;

        let ride = MessageType::from("ride_update");
        let announcement = MessageType::from("announcement");
        assert_eq!(kinds(&mut oa1), vec![ride.clone(), announcement.clone()]);
        assert_eq!(kinds(&mut oa2), vec![ride, announcement.clone()]);
        assert_eq!(kinds(&mut ob1), vec![announcement]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_that_connection() {
        let f = start();
        let (slow, mut slow_out) = Client::new("A", "ua", 1);
        let (fast, mut fast_out) = Client::new("B", "ua", 8);

        f.hub.register(slow).await;
        f.hub.register(fast).await;
        f.hub
            .broadcast_to_all(Message::new("tick", json!(1)))
            .await;
        f.hub.sync().await;

        // The slow queue still holds online(A); online(B) and tick were dropped
        assert_eq!(kinds(&mut slow_out), vec![MessageType::UserOnline]);
        assert_eq!(
            kinds(&mut fast_out),
            vec![MessageType::UserOnline, MessageType::from("tick")]
        );
        assert_eq!(f.hub.total_connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_unregister_is_noop() {
        let f = start();
        let (client, _outbound) = f.hub.client("A", "ua");
        f.hub.register(client).await;
        f.hub.sync().await;
        let before = f.hub.snapshot().await;
        let published = f.broker.published().len();

        f.hub
            .unregister(Arc::new(ClientInfo::new("A", "ua")))
            .await;
        f.hub
            .unregister(Arc::new(ClientInfo::new("nobody", "ua")))
            .await;
        f.hub.sync().await;

        assert_eq!(f.hub.snapshot().await, before);
        assert_eq!(f.broker.published().len(), published);
        assert_eq!(f.presence.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_unregister_is_noop() {
        let f = start();
        let (c1, _o1) = f.hub.client("A", "ua");
        let (c2, _o2) = f.hub.client("A", "ua");
        let info1 = Arc::clone(c1.info());
        f.hub.register(c1).await;
        f.hub.register(c2).await;

        f.hub.unregister(info1.clone()).await;
        f.hub.unregister(info1).await;
        f.hub.sync().await;

        assert_eq!(f.hub.user_connection_count("A").await, 1);
        assert_eq!(f.broker.count(&MessageType::UserOffline), 0);
    }

    #[tokio::test]
    async fn test_counts_match_model() {
        let f = start();
        let mut live: Vec<(Arc<ClientInfo>, Outbound)> = Vec::new();
        let users = ["u1", "u2", "u3"];

        for step in 0..30usize {
            if step % 3 == 2 && !live.is_empty() {
                let (info, _outbound) = live.remove(step % live.len());
                f.hub.unregister(info).await;
            } else {
                let (client, outbound) = f.hub.client(users[step % users.len()], "ua");
                live.push((Arc::clone(client.info()), outbound));
                f.hub.register(client).await;
            }
            f.hub.sync().await;

            let snapshot = f.hub.snapshot().await;
            let mut expected: BTreeMap<String, usize> = BTreeMap::new();
            for (info, _) in &live {
                *expected.entry(info.user_id.clone()).or_default() += 1;
            }

            assert_eq!(snapshot.user_connections, expected);
            assert_eq!(f.hub.total_connection_count().await, live.len());
            assert_eq!(
                f.hub.total_connection_count().await,
                snapshot.user_connections.values().sum::<usize>()
            );
            assert_eq!(f.hub.connected_user_count().await, expected.len());
            assert!(snapshot.user_connections.values().all(|n| *n > 0));
        }
    }

    #[tokio::test]
    async fn test_publish_goes_to_broker_only() {
        let f = start();
        let (client, mut outbound) = f.hub.client("A", "ua");
        f.hub.register(client).await;
        f.hub.sync().await;
        outbound.drain();

        f.hub
            .publish(Message::new("fleet_notice", json!({"n": 1})).with_target("A"))
            .await;
        f.hub.sync().await;

        assert!(outbound.drain().is_empty());
        assert_eq!(f.broker.count(&MessageType::from("fleet_notice")), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queues_and_rejects_registration() {
        let f = start();
        let (client, mut outbound) = f.hub.client("A", "ua");
        f.hub.register(client).await;
        f.hub.sync().await;

        f.cancel.cancel();
        f.task.await.unwrap();

        assert!(!f.hub.is_running());
        assert_eq!(f.hub.connected_user_count().await, 0);
        assert_eq!(kinds(&mut outbound), vec![MessageType::UserOnline]);
        assert!(outbound.recv().await.is_none());
        assert_eq!(f.presence.entry_count(), 0);

        let (late, mut late_out) = f.hub.client("B", "ua");
        f.hub.register(late).await;
        f.hub.sync().await;
        assert!(late_out.recv().await.is_none());
        assert_eq!(f.hub.connected_user_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_refresh_keeps_entries_alive() {
        let presence = MemoryPresenceStore::new();
        let config = HubConfig {
            presence_ttl: Duration::from_secs(10),
            presence_refresh: Duration::from_secs(4),
            ..HubConfig::default()
        };
        let (hub, dispatcher) = Hub::new(
            config,
            Arc::new(presence.clone()),
            Arc::new(RecordingBroker::default()),
        );
        let cancel = CancellationToken::new();
        tokio::spawn(dispatcher.run(cancel.clone()));

        let (client, _outbound) = hub.client("A", "ua");
        hub.register(client).await;
        hub.sync().await;

        tokio::time::sleep(Duration::from_secs(25)).await;
        hub.sync().await;
        assert!(presence.is_online("A").await.unwrap());

        cancel.cancel();
    }
    #[tokio::test]
    async fn test_send_to_empty_user_id_is_ignored() {
        let f = start();
        let (client, mut outbound) = f.hub.client("A", "ua");
        f.hub.register(client).await;
        f.hub.sync().await;
        outbound.drain();

        f.hub
            .send_to_user("", Message::new("chat", json!({"text": "hi"})))
            .await;
        f.hub.sync().await;

        assert!(outbound.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queries_never_see_partial_mutations() {
        let f = start();
        let done = CancellationToken::new();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let hub = f.hub.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let mut reads = 0usize;
                    loop {
                        let snapshot = hub.snapshot().await;
                        assert_eq!(
                            snapshot.total_connections,
                            snapshot.user_connections.values().sum::<usize>()
                        );
                        assert_eq!(snapshot.total_users, snapshot.user_connections.len());
                        assert!(snapshot.user_connections.values().all(|n| *n > 0));

                        let users = hub.online_user_ids().await;
                        for user_id in &users {
                            let _ = hub.user_connection_count(user_id).await;
                        }
                        let _ = hub.total_connection_count().await;

                        reads += 1;
                        if done.is_cancelled() {
                            return reads;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let users = ["u1", "u2", "u3", "u4", "u5"];
        let mut live: Vec<(Arc<ClientInfo>, Outbound)> = Vec::new();
        for step in 0..300usize {
            if step % 3 == 2 {
                let (info, _outbound) = live.remove(0);
                f.hub.unregister(info).await;
            } else {
                let (client, outbound) = f.hub.client(users[step % users.len()], "ua");
                live.push((Arc::clone(client.info()), outbound));
                f.hub.register(client).await;
            }
            if step % 10 == 0 {
                f.hub
                    .broadcast_to_all(Message::new("tick", json!(step)))
                    .await;
            }
        }
        f.hub.sync().await;
        done.cancel();

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        assert_eq!(f.hub.total_connection_count().await, live.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_presence_store_keeps_backlog_bounded() {
        let config = HubConfig {
            effect_queue_capacity: 16,
            presence_refresh: Duration::from_secs(1),
            ..HubConfig::default()
        };
        let (hub, dispatcher) = Hub::new(
            config,
            Arc::new(HangingStore),
            Arc::new(RecordingBroker::default()),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(cancel.clone()));

        let mut outbounds = Vec::new();
        for i in 0..200 {
            let (client, outbound) = hub.client(format!("user-{i}"), "ua");
            outbounds.push(outbound);
            hub.register(client).await;
        }

        // Refresh ticks keep firing while every store call hangs.
        tokio::time::sleep(Duration::from_secs(120)).await;

        // At most a full queue of effects, each bounded by the effect timeout.
        let started = Instant::now();
        hub.sync().await;
        assert!(started.elapsed() <= Duration::from_secs(40));
        assert_eq!(hub.total_connection_count().await, 200);

        let started = Instant::now();
        cancel.cancel();
        task.await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert_eq!(hub.connected_user_count().await, 0);
        for mut outbound in outbounds {
            outbound.drain();
            assert!(outbound.recv().await.is_none());
        }
    }
}

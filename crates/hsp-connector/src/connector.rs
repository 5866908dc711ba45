//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Connector orchestration over bridge, resilience and fallback."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! The connector: one object per node that owns the broker link, the
//! internal bus and the fallback protocols.
//!
//! Every outbound message first goes through the circuit breaker and the
//! retry policy on the broker link. When that path fails, or an expected
//! acknowledgement does not arrive in time, the message is handed to the
//! fallback manager. Inbound traffic from both paths ends up on the same
//! internal bus.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hsp_common::{BridgeConfig, SharedRegistry};
use hsp_msg::{
    log_envelope, AckPayload, CapabilityAdvertisementPayload, DropReason, Envelope,
    EnvelopeBuilder, FactPayload, HspPayload, InternalBus, MessageDirection, MessageType,
    MessagingMetricsExporter, Priority, SubscriptionId, TaskRequestPayload, TaskResultPayload,
    TopicMapping, WireTopics,
};
use hsp_resilience::{
    CircuitBreaker, CircuitError, CircuitSnapshot, CircuitState, DegradationLevel,
    DegradationTracker, FallbackError, FallbackManager, FallbackMessage, FallbackSettings,
    FallbackStatus, FileMailboxProtocol, HttpProtocol, InMemoryProtocol, MemoryHub,
    MessagePriority, ResilienceMetrics, RetryPolicy,
};
use hsp_transport::{
    inbound_handler, InboundMessage, MqttTransport, ReconnectBackoff, TransportAdapter,
    TransportError,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use strum::{AsRefStr, Display};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::{BusMessage, InboundOutcome, InboundPath, MessageBridge};
use crate::error::{AckOutcome, ConnectorError, DeliveryPath, DeliveryReceipt};

/// `message_type` of fallback messages carrying a wrapped envelope.
pub const FALLBACK_MESSAGE_TYPE: &str = "hsp_message";

/// Lifecycle of the broker connection as seen by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No broker link.
    Disconnected,
    /// [`Connector::connect`] is running.
    Connecting,
    /// Broker link up.
    Connected,
    /// [`Connector::disconnect`] is running.
    Disconnecting,
}

/// Supplies capabilities to advertise on every (re)connect.
pub type CapabilityProvider = Arc<dyn Fn() -> Vec<CapabilityAdvertisementPayload> + Send + Sync>;

/// Callback fired on link transitions.
pub type LinkListener = Arc<dyn Fn() + Send + Sync>;

/// Snapshot returned by [`Connector::communication_status`].
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationStatus {
    pub node_id: String,
    pub state: ConnectionState,
    pub primary_connected: bool,
    pub degraded: bool,
    pub level: DegradationLevel,
    pub pending_acks: usize,
    pub circuit: CircuitSnapshot,
    pub fallback: Option<FallbackStatus>,
}

/// Result of [`Connector::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// At least one path can carry messages.
    pub healthy: bool,
    pub level: DegradationLevel,
    pub primary_connected: bool,
    pub fallback_protocol: Option<String>,
    pub circuit_state: CircuitState,
}

struct PendingAck {
    tx: oneshot::Sender<Duration>,
    sent_at: Instant,
}

/// Removes an ack waiter when the publish that registered it returns.
struct WaiterGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingAck>>,
    correlation_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

/// Counts a send in progress so shutdown can wait for it.
struct InFlightGuard {
    inner: Arc<ConnectorInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Assembles a [`Connector`] from configuration.
pub struct ConnectorBuilder {
    config: BridgeConfig,
    transport: Option<Arc<dyn TransportAdapter>>,
    memory_hub: Option<MemoryHub>,
    registry: Option<SharedRegistry>,
    mapping: TopicMapping,
}

impl ConnectorBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            transport: None,
            memory_hub: None,
            registry: None,
            mapping: TopicMapping::default(),
        }
    }

    /// Use `transport` instead of an MQTT client built from the config.
    pub fn transport(mut self, transport: Arc<dyn TransportAdapter>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Hub shared by the in-memory fallback of co-located connectors.
    pub fn memory_hub(mut self, hub: MemoryHub) -> Self {
        self.memory_hub = Some(hub);
        self
    }

    /// Register messaging and resilience metrics in `registry`.
    pub fn registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the message type to bus channel table.
    pub fn topic_mapping(mut self, mapping: TopicMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn build(self) -> anyhow::Result<Connector> {
        let ConnectorBuilder {
            config,
            transport,
            memory_hub,
            registry,
            mapping,
        } = self;
        config.validate()?;
        let node_id = config.node_id.clone();

        let transport: Arc<dyn TransportAdapter> =
            transport.unwrap_or_else(|| Arc::new(MqttTransport::from_config(&config)));

        let (messaging_metrics, resilience_metrics) = match &registry {
            Some(registry) => (
                Some(
                    MessagingMetricsExporter::register(registry)
                        .context("registering messaging metrics")?,
                ),
                Some(
                    ResilienceMetrics::new(registry)
                        .context("registering resilience metrics")?,
                ),
            ),
            None => (None, None),
        };

        let bus = InternalBus::new();
        let bridge = MessageBridge::new(
            node_id.clone(),
            Arc::clone(&transport),
            bus,
            mapping,
            WireTopics::new(config.namespace.clone()),
            messaging_metrics.clone(),
        );
        let retry = RetryPolicy::from_config(&config.retry).with_metrics(resilience_metrics.clone());
        let breaker = CircuitBreaker::from_config("broker-publish", &config.circuit_breaker)
            .with_metrics(resilience_metrics.clone());

        let mut http = None;
        let fallback = if config.fallback.enabled {
            let manager = FallbackManager::new(
                FallbackSettings::from_config(&config.fallback),
                resilience_metrics.clone(),
            );
            let section = &config.fallback;
            if section.memory.enabled {
                let hub = memory_hub.unwrap_or_default();
                manager.add_protocol(
                    Arc::new(InMemoryProtocol::new(node_id.clone(), hub)),
                    section.memory.priority,
                );
            }
            if section.file.enabled {
                manager.add_protocol(
                    Arc::new(FileMailboxProtocol::from_config(node_id.clone(), &section.file)),
                    section.file.priority,
                );
            }
            if section.http.enabled {
                let protocol = Arc::new(HttpProtocol::from_config(node_id.clone(), &section.http));
                manager.add_protocol(protocol.clone(), section.http.priority);
                http = Some(protocol);
            }
            Some(manager)
        } else {
            None
        };

        let inner = Arc::new(ConnectorInner {
            connect_backoff: ReconnectBackoff::from_config(&config.broker.reconnect),
            node_id,
            config,
            transport,
            bridge,
            retry,
            breaker,
            fallback,
            http,
            state: RwLock::new(ConnectionState::Disconnected),
            degradation: Mutex::new(DegradationTracker::new(resilience_metrics)),
            pending: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(Vec::new()),
            capability_provider: RwLock::new(None),
            connect_listeners: RwLock::new(Vec::new()),
            disconnect_listeners: RwLock::new(Vec::new()),
            accepting: AtomicBool::new(true),
            manual_disconnect: AtomicBool::new(false),
            fallback_started: AtomicBool::new(false),
            watcher_started: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            metrics: messaging_metrics,
        });
        let connector = Connector { inner };
        connector.install_inbound();
        connector.install_ack_resolver();
        Ok(connector)
    }
}

struct ConnectorInner {
    node_id: String,
    config: BridgeConfig,
    transport: Arc<dyn TransportAdapter>,
    bridge: MessageBridge,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    connect_backoff: ReconnectBackoff,
    fallback: Option<FallbackManager>,
    http: Option<Arc<HttpProtocol>>,
    state: RwLock<ConnectionState>,
    degradation: Mutex<DegradationTracker>,
    pending: Mutex<HashMap<String, PendingAck>>,
    capabilities: Mutex<Vec<CapabilityAdvertisementPayload>>,
    capability_provider: RwLock<Option<CapabilityProvider>>,
    connect_listeners: RwLock<Vec<LinkListener>>,
    disconnect_listeners: RwLock<Vec<LinkListener>>,
    accepting: AtomicBool,
    manual_disconnect: AtomicBool,
    fallback_started: AtomicBool,
    watcher_started: AtomicBool,
    reconnecting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Option<MessagingMetricsExporter>,
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Handle to a running connector. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("node_id", &self.inner.node_id)
            .field("state", &self.state())
            .field("transport", &self.inner.transport.name())
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn builder(config: BridgeConfig) -> ConnectorBuilder {
        ConnectorBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Whether the broker link is up right now.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Broker down but a fallback protocol is carrying traffic.
    pub fn is_degraded(&self) -> bool {
        !self.is_connected() && self.active_fallback().is_some()
    }

    pub fn bus(&self) -> &InternalBus<BusMessage> {
        self.inner.bridge.bus()
    }

    pub fn bridge(&self) -> &MessageBridge {
        &self.inner.bridge
    }

    pub fn fallback(&self) -> Option<&FallbackManager> {
        self.inner.fallback.as_ref()
    }

    /// Number of sends waiting for an acknowledgement.
    pub fn pending_acks(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Envelope builder with this node as sender.
    pub fn envelope(&self, message_type: MessageType, payload: Value) -> EnvelopeBuilder {
        Envelope::builder(self.inner.node_id.clone(), message_type, payload)
    }

    /// Register the HTTP fallback base URL of a peer. Returns `false` when
    /// the HTTP protocol is disabled.
    pub fn add_http_endpoint(&self, node_id: impl Into<String>, base: Url) -> bool {
        match &self.inner.http {
            Some(http) => {
                http.add_endpoint(node_id, base);
                true
            }
            None => false,
        }
    }

    /// Address of the local HTTP fallback endpoint while it listens.
    pub fn http_local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.http.as_ref().and_then(|http| http.local_addr())
    }

    // ----- lifecycle -----

    /// Connect to the broker, trying `connect_attempts` times with backoff in
    /// between. The fallback protocols are started either way; when the
    /// broker stays unreachable the connector keeps running on them, keeps
    /// retrying the broker in the background and returns
    /// [`ConnectorError::ConnectFailed`].
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(ConnectorError::ShuttingDown);
        }
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let attempts = self.inner.config.connect_attempts.max(1);
        let timeout = self.inner.config.broker.connect_timeout;
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.inner.transport.connect(timeout).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(err) => {
                    warn!(
                        node_id = %self.inner.node_id,
                        attempt = attempt + 1,
                        attempts,
                        error = %err,
                        "broker connection attempt failed"
                    );
                    last_error = Some(err);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.inner.connect_backoff.delay(attempt)).await;
                    }
                }
            }
        }

        self.subscribe_defaults().await;
        self.start_fallback().await;
        self.spawn_link_watcher();

        match last_error {
            None => {
                self.set_state(ConnectionState::Connected);
                self.refresh_degradation();
                info!(
                    node_id = %self.inner.node_id,
                    transport = self.inner.transport.name(),
                    "connected to broker"
                );
                notify(&self.inner.connect_listeners);
                self.advertise_capabilities().await;
                Ok(())
            }
            Some(last_error) => {
                self.set_state(ConnectionState::Disconnected);
                let level = self.refresh_degradation();
                warn!(
                    node_id = %self.inner.node_id,
                    attempts,
                    level = %level,
                    "broker unreachable; continuing on fallback protocols"
                );
                self.spawn_reconnect(attempts);
                Err(ConnectorError::ConnectFailed {
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// Close the broker link. Fallback protocols keep running.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        let was_connected = self.state() == ConnectionState::Connected;
        self.set_state(ConnectionState::Disconnecting);
        let result = self.inner.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        self.refresh_degradation();
        if was_connected {
            notify(&self.inner.disconnect_listeners);
        }
        info!(node_id = %self.inner.node_id, "disconnected from broker");
        result
    }

    /// Stop accepting sends, wait for in-flight ones, then tear down the
    /// broker link, the fallback protocols and background tasks.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            node_id = %self.inner.node_id,
            in_flight = self.inner.in_flight.load(Ordering::SeqCst),
            "shutting down connector"
        );
        self.wait_idle().await;
        if let Err(err) = self.disconnect().await {
            warn!(node_id = %self.inner.node_id, error = %err, "broker disconnect failed during shutdown");
        }
        if let Some(manager) = &self.inner.fallback {
            manager.shutdown().await;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        info!(node_id = %self.inner.node_id, "connector stopped");
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn begin_send(&self) -> Result<InFlightGuard, ConnectorError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(ConnectorError::ShuttingDown);
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
        };
        // Shutdown may have started between the check and the increment.
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(ConnectorError::ShuttingDown);
        }
        Ok(guard)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), next);
        if previous != next {
            debug!(node_id = %self.inner.node_id, from = %previous, to = %next, "connection state changed");
        }
    }

    fn active_fallback(&self) -> Option<&'static str> {
        self.inner
            .fallback
            .as_ref()
            .and_then(FallbackManager::active_protocol_name)
    }

    fn refresh_degradation(&self) -> DegradationLevel {
        let fallback = self.active_fallback();
        self.inner
            .degradation
            .lock()
            .evaluate(self.is_connected(), fallback)
            .level
    }

    async fn subscribe_defaults(&self) {
        let filters = self.inner.bridge.topics().subscriptions_for(&self.inner.node_id);
        for filter in filters {
            if let Err(err) = self.inner.transport.subscribe(&filter).await {
                warn!(node_id = %self.inner.node_id, filter = %filter, error = %err, "subscribe failed");
            }
        }
    }

    async fn start_fallback(&self) {
        let Some(manager) = &self.inner.fallback else {
            return;
        };
        if self.inner.fallback_started.swap(true, Ordering::SeqCst) {
            return;
        }
        match manager.initialize().await {
            Ok(()) => info!(
                node_id = %self.inner.node_id,
                active = ?manager.active_protocol_name(),
                "fallback protocols ready"
            ),
            Err(err) => {
                warn!(node_id = %self.inner.node_id, error = %err, "no fallback protocol available");
                self.inner.fallback_started.store(false, Ordering::SeqCst);
                return;
            }
        }
        manager.start_monitor();

        if let Some(mut inbound) = manager.take_inbound() {
            let weak = Arc::downgrade(&self.inner);
            let task = tokio::spawn(async move {
                while let Some(message) = inbound.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    Connector { inner }.handle_fallback_message(message).await;
                }
            });
            self.inner.tasks.lock().push(task);
        }
    }

    fn spawn_link_watcher(&self) {
        if self.inner.watcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut link = self.inner.transport.link_state();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut last = *link.borrow_and_update();
            while link.changed().await.is_ok() {
                let up = *link.borrow_and_update();
                if up == last {
                    continue;
                }
                last = up;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let connector = Connector { inner };
                if up {
                    connector.on_link_restored().await;
                } else {
                    connector.on_link_lost();
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Retry the broker with backoff until the link is up, the connector
    /// shuts down or the caller disconnects. The link watcher then performs
    /// the restore work.
    fn spawn_reconnect(&self, first_attempt: u32) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut attempt = first_attempt;
            loop {
                let Some(delay) = weak.upgrade().map(|inner| inner.connect_backoff.delay(attempt)) else {
                    return;
                };
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.transport.is_connected()
                    || !inner.accepting.load(Ordering::SeqCst)
                    || inner.manual_disconnect.load(Ordering::SeqCst)
                {
                    break;
                }
                attempt = attempt.saturating_add(1);
                match inner.transport.connect(inner.config.broker.connect_timeout).await {
                    Ok(()) => {
                        info!(node_id = %inner.node_id, attempt, "broker reachable again");
                        break;
                    }
                    Err(err) => debug!(
                        node_id = %inner.node_id,
                        attempt,
                        error = %err,
                        "background broker connection attempt failed"
                    ),
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.reconnecting.store(false, Ordering::SeqCst);
            }
        });
        self.inner.tasks.lock().push(task);
    }

    fn on_link_lost(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        let level = self.refresh_degradation();
        warn!(node_id = %self.inner.node_id, level = %level, "broker link lost");
        notify(&self.inner.disconnect_listeners);
    }

    async fn on_link_restored(&self) {
        if self.state() != ConnectionState::Disconnected
            || !self.inner.accepting.load(Ordering::SeqCst)
            || self.inner.manual_disconnect.load(Ordering::SeqCst)
        {
            return;
        }
        self.set_state(ConnectionState::Connected);
        self.refresh_degradation();
        info!(node_id = %self.inner.node_id, "broker link restored");
        notify(&self.inner.connect_listeners);
        self.advertise_capabilities().await;
    }

    // ----- outbound -----

    /// Publish `envelope` on its conventional wire topic.
    pub async fn send(&self, envelope: Envelope) -> Result<DeliveryReceipt, ConnectorError> {
        let topic = self.inner.bridge.topics().for_envelope(&envelope);
        self.publish(&topic, envelope).await
    }

    /// Publish `envelope` on `topic`.
    ///
    /// Without `requires_ack` this returns once the broker or a fallback
    /// protocol accepted the message. With it, the call waits up to
    /// `ack_timeout` per attempt for the peer's acknowledgement and hands
    /// the message to the fallback manager when none arrives.
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<DeliveryReceipt, ConnectorError> {
        let _guard = self.begin_send()?;
        if envelope.requires_ack() {
            self.publish_acknowledged(topic, envelope).await
        } else {
            self.deliver_once(topic, &envelope).await
        }
    }

    async fn deliver_once(&self, topic: &str, envelope: &Envelope) -> Result<DeliveryReceipt, ConnectorError> {
        let bytes = MessageBridge::encode(envelope)?;
        let primary_error = match self.send_primary(topic, &bytes).await {
            Ok(()) => {
                self.record_primary(topic, envelope);
                return Ok(receipt(envelope, DeliveryPath::Primary, AckOutcome::NotRequested));
            }
            Err(err) => err,
        };
        match self.send_fallback(topic, envelope).await {
            Ok(protocol) => Ok(receipt(
                envelope,
                DeliveryPath::Fallback(protocol),
                AckOutcome::NotRequested,
            )),
            Err(fallback_error) => Err(ConnectorError::DeliveryFailure {
                message_id: envelope.message_id.clone(),
                reason: format!("primary: {}; fallback: {}", primary_error, fallback_error),
            }),
        }
    }

    async fn publish_acknowledged(&self, topic: &str, envelope: Envelope) -> Result<DeliveryReceipt, ConnectorError> {
        let bytes = MessageBridge::encode(&envelope)?;
        let mut rx = self.register_waiter(&envelope)?;
        let _waiter = WaiterGuard {
            pending: &self.inner.pending,
            correlation_id: envelope.correlation_id.clone(),
        };
        let attempts = self.inner.config.ack.max_ack_retries.max(1);
        let ack_timeout = self.inner.config.ack.ack_timeout;
        let mut waiter_closed = false;
        let mut last_reason = String::from("no delivery attempt made");

        for attempt in 1..=attempts {
            let ack = match self.send_primary(topic, &bytes).await {
                Ok(()) if waiter_closed => {
                    self.record_primary(topic, &envelope);
                    AckOutcome::NotAwaited
                }
                Ok(()) => {
                    self.record_primary(topic, &envelope);
                    match tokio::time::timeout(ack_timeout, &mut rx).await {
                        Ok(Ok(latency)) => {
                            return Ok(receipt(
                                &envelope,
                                DeliveryPath::Primary,
                                AckOutcome::Acknowledged { latency },
                            ));
                        }
                        Ok(Err(_)) => {
                            waiter_closed = true;
                            AckOutcome::NotAwaited
                        }
                        Err(_) => match rx.try_recv() {
                            Ok(latency) => {
                                return Ok(receipt(
                                    &envelope,
                                    DeliveryPath::Primary,
                                    AckOutcome::Acknowledged { latency },
                                ));
                            }
                            Err(TryRecvError::Empty) => {
                                info!(
                                    message_id = %envelope.message_id,
                                    attempt,
                                    attempts,
                                    timeout = ?ack_timeout,
                                    "acknowledgement timed out; trying fallback"
                                );
                                last_reason = format!("no acknowledgement within {:?}", ack_timeout);
                                AckOutcome::TimedOut
                            }
                            Err(TryRecvError::Closed) => {
                                waiter_closed = true;
                                AckOutcome::TimedOut
                            }
                        },
                    }
                }
                Err(err) => {
                    last_reason = format!("primary: {}", err);
                    AckOutcome::NotAwaited
                }
            };

            match self.send_fallback(topic, &envelope).await {
                Ok(protocol) => {
                    return Ok(receipt(&envelope, DeliveryPath::Fallback(protocol), ack));
                }
                Err(err) => {
                    warn!(
                        message_id = %envelope.message_id,
                        attempt,
                        attempts,
                        error = %err,
                        "fallback hand-off failed"
                    );
                    last_reason = format!("{}; fallback: {}", last_reason, err);
                }
            }
        }

        Err(ConnectorError::DeliveryFailure {
            message_id: envelope.message_id.clone(),
            reason: last_reason,
        })
    }

    fn register_waiter(&self, envelope: &Envelope) -> Result<oneshot::Receiver<Duration>, ConnectorError> {
        let mut pending = self.inner.pending.lock();
        if pending.contains_key(&envelope.correlation_id) {
            return Err(ConnectorError::DeliveryFailure {
                message_id: envelope.message_id.clone(),
                reason: format!(
                    "correlation id {} already awaits an acknowledgement",
                    envelope.correlation_id
                ),
            });
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            envelope.correlation_id.clone(),
            PendingAck {
                tx,
                sent_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    async fn send_primary(&self, topic: &str, bytes: &Bytes) -> Result<(), CircuitError<TransportError>> {
        if !self.inner.transport.is_connected() {
            return Err(CircuitError::Inner(TransportError::NotConnected));
        }
        let inner = &self.inner;
        let result = inner
            .breaker
            .call(|| {
                inner
                    .retry
                    .execute("publish", |_| inner.bridge.forward(topic, bytes.clone()))
            })
            .await;
        if let Err(err) = &result {
            if err.is_open() {
                debug!(topic = %topic, "broker circuit open; skipping primary path");
            } else {
                warn!(topic = %topic, error = %err, "broker publish failed");
            }
        }
        result
    }

    fn record_primary(&self, topic: &str, envelope: &Envelope) {
        log_envelope(MessageDirection::Outbound, topic, envelope);
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_sent(envelope, "primary");
        }
    }

    async fn send_fallback(&self, topic: &str, envelope: &Envelope) -> Result<&'static str, FallbackError> {
        let Some(manager) = &self.inner.fallback else {
            return Err(FallbackError::NoActiveProtocol);
        };
        let mut payload = serde_json::Map::new();
        payload.insert("topic".to_owned(), Value::String(topic.to_owned()));
        payload.insert("envelope".to_owned(), serde_json::to_value(envelope)?);
        let message = manager
            .new_message(
                &self.inner.node_id,
                &envelope.recipient_id,
                FALLBACK_MESSAGE_TYPE,
                Value::Object(payload),
            )
            .with_correlation_id(envelope.correlation_id.clone())
            .with_priority(fallback_priority(envelope.qos.priority));
        let protocol = manager.send(message).await?;

        log_envelope(MessageDirection::Fallback, topic, envelope);
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_sent(envelope, "fallback");
        }
        info!(
            message_id = %envelope.message_id,
            protocol,
            "message delivered via fallback"
        );
        self.refresh_degradation();
        Ok(protocol)
    }

    // ----- inbound -----

    fn install_inbound(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .transport
            .set_inbound(inbound_handler(move |message: InboundMessage| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let connector = Connector { inner };
                    let outcome = connector
                        .inner
                        .bridge
                        .handle_inbound(&message.topic, &message.payload, InboundPath::Broker)
                        .await;
                    connector.after_inbound(outcome).await;
                }
            }));
    }

    fn install_ack_resolver(&self) {
        let Some(channel) = self
            .inner
            .bridge
            .mapping()
            .channel_for(MessageType::Acknowledgement)
        else {
            warn!(node_id = %self.inner.node_id, "acknowledgements are unmapped; acked sends will time out");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        self.bus().subscribe(channel, move |message: BusMessage| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Connector { inner }.resolve_ack(&message);
                }
                Ok(())
            }
        });
    }

    fn resolve_ack(&self, message: &BusMessage) {
        let correlation_id = &message.envelope.correlation_id;
        let pending = self.inner.pending.lock().remove(correlation_id);
        match pending {
            Some(PendingAck { tx, sent_at }) => {
                let latency = sent_at.elapsed();
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_ack(latency);
                }
                debug!(
                    correlation_id = %correlation_id,
                    from = %message.envelope.sender_id,
                    latency = ?latency,
                    "acknowledgement matched"
                );
                let _ = tx.send(latency);
            }
            None => debug!(
                correlation_id = %correlation_id,
                "acknowledgement without a waiting send"
            ),
        }
    }

    async fn handle_fallback_message(&self, message: FallbackMessage) {
        if message.message_type != FALLBACK_MESSAGE_TYPE {
            debug!(
                message_id = %message.id,
                message_type = %message.message_type,
                "ignoring foreign fallback message"
            );
            return;
        }
        let mut payload = message.payload;
        let topic = payload
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let Some(envelope) = payload.get_mut("envelope").map(Value::take) else {
            warn!(message_id = %message.id, "fallback message without envelope");
            if let Some(metrics) = &self.inner.metrics {
                metrics.observe_dropped(DropReason::MissingField);
            }
            return;
        };
        let outcome = self
            .inner
            .bridge
            .handle_inbound_value(&topic, envelope, InboundPath::Fallback)
            .await;
        self.after_inbound(outcome).await;
    }

    /// Answers envelopes that asked for an acknowledgement, after their
    /// handlers ran. Returns once the acknowledgement was handed to the
    /// broker or a fallback protocol.
    async fn after_inbound(&self, outcome: InboundOutcome) {
        let InboundOutcome::Delivered { message, .. } = outcome else {
            return;
        };
        let envelope = &message.envelope;
        if !envelope.requires_ack() || envelope.message_type == MessageType::Acknowledgement {
            return;
        }
        let Ok(_guard) = self.begin_send() else {
            debug!(message_id = %envelope.message_id, "shutting down; acknowledgement skipped");
            return;
        };
        let ack = match envelope.acknowledgement(&self.inner.node_id) {
            Ok(ack) => ack,
            Err(err) => {
                warn!(message_id = %envelope.message_id, error = %err, "could not build acknowledgement");
                return;
            }
        };
        let topic = self.inner.bridge.topics().acks(&ack.recipient_id);
        match self.deliver_once(&topic, &ack).await {
            Ok(receipt) => debug!(
                correlation_id = %receipt.correlation_id,
                path = ?receipt.path,
                "acknowledgement sent"
            ),
            Err(err) => warn!(
                correlation_id = %ack.correlation_id,
                error = %err,
                "acknowledgement could not be delivered"
            ),
        }
    }

    // ----- callbacks -----

    /// Run `handler` for every inbound message whose payload decodes as `P`.
    /// Returns `None` when the message type is unmapped.
    pub fn on_message<P, F, Fut>(&self, handler: F) -> Option<SubscriptionId>
    where
        P: HspPayload,
        F: Fn(P, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let channel = self.inner.bridge.mapping().channel_for(P::MESSAGE_TYPE)?;
        let handler = Arc::new(handler);
        Some(self.bus().subscribe(channel, move |message: BusMessage| {
            let handler = Arc::clone(&handler);
            async move {
                match P::from_typed(message.payload.clone()) {
                    Some(payload) => handler(payload, message).await,
                    None => Ok(()),
                }
            }
        }))
    }

    pub fn on_fact<F, Fut>(&self, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(FactPayload, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_message::<FactPayload, _, _>(handler)
    }

    pub fn on_capability_advertisement<F, Fut>(&self, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(CapabilityAdvertisementPayload, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_message::<CapabilityAdvertisementPayload, _, _>(handler)
    }

    pub fn on_task_request<F, Fut>(&self, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(TaskRequestPayload, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_message::<TaskRequestPayload, _, _>(handler)
    }

    pub fn on_task_result<F, Fut>(&self, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(TaskResultPayload, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_message::<TaskResultPayload, _, _>(handler)
    }

    pub fn on_acknowledgement<F, Fut>(&self, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(AckPayload, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_message::<AckPayload, _, _>(handler)
    }

    /// Untyped handler for every message of `message_type`.
    pub fn register_callback<F, Fut>(&self, message_type: MessageType, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let channel = self.inner.bridge.mapping().channel_for(message_type)?;
        Some(self.bus().subscribe(channel, handler))
    }

    pub fn unregister_callback(&self, message_type: MessageType, id: SubscriptionId) -> bool {
        self.inner
            .bridge
            .mapping()
            .channel_for(message_type)
            .map(|channel| self.bus().unsubscribe(&channel, id))
            .unwrap_or(false)
    }

    pub fn on_connect(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.connect_listeners.write().push(Arc::new(listener));
    }

    pub fn on_disconnect(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.disconnect_listeners.write().push(Arc::new(listener));
    }

    /// Add a raw broker subscription on top of the default set.
    pub async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.inner.transport.subscribe(filter).await
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.inner.transport.unsubscribe(filter).await
    }

    // ----- convenience senders -----

    /// Broadcast a fact.
    pub async fn publish_fact(&self, fact: &FactPayload, requires_ack: bool) -> Result<DeliveryReceipt, ConnectorError> {
        let envelope = EnvelopeBuilder::typed(self.inner.node_id.clone(), fact)?
            .requires_ack(requires_ack)
            .build();
        self.send(envelope).await
    }

    /// Send a task request to `recipient` and wait for its acknowledgement.
    /// Returns the correlation id results will carry.
    pub async fn send_task_request(
        &self,
        recipient: &str,
        request: &TaskRequestPayload,
    ) -> Result<(String, DeliveryReceipt), ConnectorError> {
        let envelope = EnvelopeBuilder::typed(self.inner.node_id.clone(), request)?
            .recipient(recipient)
            .requires_ack(true)
            .build();
        let receipt = self.send(envelope).await?;
        Ok((receipt.correlation_id.clone(), receipt))
    }

    /// Answer a task request. `correlation_id` is the one the request carried.
    pub async fn send_task_result(
        &self,
        recipient: &str,
        result: &TaskResultPayload,
        correlation_id: &str,
    ) -> Result<DeliveryReceipt, ConnectorError> {
        let envelope = EnvelopeBuilder::typed(self.inner.node_id.clone(), result)?
            .recipient(recipient)
            .correlation_id(correlation_id)
            .requires_ack(true)
            .build();
        self.send(envelope).await
    }

    pub async fn publish_capability_advertisement(
        &self,
        advertisement: &CapabilityAdvertisementPayload,
    ) -> Result<DeliveryReceipt, ConnectorError> {
        let envelope = EnvelopeBuilder::typed(self.inner.node_id.clone(), advertisement)?.build();
        self.send(envelope).await
    }

    /// Remember `advertisement` for re-publication after every reconnect
    /// and publish it now when the broker is up.
    pub async fn advertise_capability(
        &self,
        advertisement: CapabilityAdvertisementPayload,
    ) -> Result<Option<DeliveryReceipt>, ConnectorError> {
        {
            let mut capabilities = self.inner.capabilities.lock();
            capabilities.retain(|known| known.capability_id != advertisement.capability_id);
            capabilities.push(advertisement.clone());
        }
        if !self.is_connected() {
            return Ok(None);
        }
        self.publish_capability_advertisement(&advertisement).await.map(Some)
    }

    /// Capabilities computed at advertisement time, in addition to the ones
    /// registered with [`Self::advertise_capability`].
    pub fn set_capability_provider(
        &self,
        provider: impl Fn() -> Vec<CapabilityAdvertisementPayload> + Send + Sync + 'static,
    ) {
        *self.inner.capability_provider.write() = Some(Arc::new(provider));
    }

    async fn advertise_capabilities(&self) {
        let mut advertisements = self.inner.capabilities.lock().clone();
        let provider = self.inner.capability_provider.read().clone();
        if let Some(provider) = provider {
            advertisements.extend(provider());
        }
        if advertisements.is_empty() {
            return;
        }
        debug!(
            node_id = %self.inner.node_id,
            count = advertisements.len(),
            "advertising capabilities"
        );
        for advertisement in advertisements {
            if let Err(err) = self.publish_capability_advertisement(&advertisement).await {
                warn!(
                    capability_id = %advertisement.capability_id,
                    error = %err,
                    "capability advertisement failed"
                );
            }
        }
    }

    // ----- status -----

    pub fn communication_status(&self) -> CommunicationStatus {
        let primary_connected = self.is_connected();
        let fallback = self.active_fallback();
        CommunicationStatus {
            node_id: self.inner.node_id.clone(),
            state: self.state(),
            primary_connected,
            degraded: !primary_connected && fallback.is_some(),
            level: DegradationLevel::determine(primary_connected, fallback),
            pending_acks: self.pending_acks(),
            circuit: self.inner.breaker.snapshot(),
            fallback: self.inner.fallback.as_ref().map(FallbackManager::status),
        }
    }

    /// Re-run fallback protocol selection and report whether any path works.
    pub async fn health_check(&self) -> HealthReport {
        let fallback = match &self.inner.fallback {
            Some(manager) if manager.is_initialized() => manager.select_active().await,
            _ => None,
        };
        let primary_connected = self.is_connected();
        let level = self.refresh_degradation();
        HealthReport {
            healthy: level != DegradationLevel::Offline,
            level,
            primary_connected,
            fallback_protocol: fallback.map(str::to_owned),
            circuit_state: self.inner.breaker.state(),
        }
    }
}

fn receipt(envelope: &Envelope, path: DeliveryPath, ack: AckOutcome) -> DeliveryReceipt {
    DeliveryReceipt {
        message_id: envelope.message_id.clone(),
        correlation_id: envelope.correlation_id.clone(),
        path,
        ack,
    }
}

fn fallback_priority(priority: Priority) -> MessagePriority {
    match priority {
        Priority::Low => MessagePriority::Low,
        Priority::Medium => MessagePriority::Normal,
        Priority::High => MessagePriority::High,
    }
}

fn notify(listeners: &RwLock<Vec<LinkListener>>) {
    let listeners = listeners.read().clone();
    for listener in listeners {
        listener();
    }
}

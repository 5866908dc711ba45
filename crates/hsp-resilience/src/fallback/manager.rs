//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Priority ordered set of fallback protocols.
//!
//! The manager initializes every registered protocol, keeps all of them
//! listening and pins the highest priority healthy one for outbound traffic.
//! A recipient the pinned protocol cannot reach is tried on the others
//! before the attempt counts as failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hsp_common::FallbackConfig;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{FallbackError, FallbackMessage, FallbackProtocol, InboundSink, ProtocolStats, ProtocolStatus};
use crate::metrics::ResilienceMetrics;

/// Manager tunables, usually taken from the `[fallback]` section.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Period of the background `select_active` probe.
    pub health_check_interval: Duration,
    /// Attempt budget stamped on messages built by [`FallbackManager::new_message`].
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Lifetime stamped on messages built by [`FallbackManager::new_message`].
    pub message_ttl: Duration,
}

impl FallbackSettings {
    /// Extract the manager tunables from configuration.
    pub fn from_config(config: &FallbackConfig) -> Self {
        Self {
            health_check_interval: config.health_check_interval,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            message_ttl: config.message_ttl,
        }
    }
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self::from_config(&FallbackConfig::default())
    }
}

/// Per-protocol line of a [`FallbackStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolReport {
    /// Protocol name.
    pub name: String,
    /// Selection priority, higher wins.
    pub priority: u8,
    /// Reported status.
    pub status: ProtocolStatus,
    /// Counters.
    pub stats: ProtocolStats,
}

/// Snapshot of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStatus {
    /// Whether `initialize` brought up at least one protocol.
    pub initialized: bool,
    /// Protocol currently pinned as active.
    pub active_protocol: Option<String>,
    /// Every registered protocol, highest priority first.
    pub protocols: Vec<ProtocolReport>,
}

#[derive(Clone)]
struct Registered {
    priority: u8,
    protocol: Arc<dyn FallbackProtocol>,
}

struct ManagerInner {
    settings: FallbackSettings,
    protocols: RwLock<Vec<Registered>>,
    active: tokio::sync::Mutex<Option<&'static str>>,
    active_name: RwLock<Option<&'static str>>,
    inbound_tx: InboundSink,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<FallbackMessage>>>,
    initialized: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<ResilienceMetrics>,
}

/// Ordered set of fallback protocols with one pinned as active.
///
/// Cloning shares the same manager.
#[derive(Clone)]
pub struct FallbackManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for FallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackManager")
            .field("active", &self.active_protocol_name())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl FallbackManager {
    /// Empty manager.
    pub fn new(settings: FallbackSettings, metrics: Option<ResilienceMetrics>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                protocols: RwLock::new(Vec::new()),
                active: tokio::sync::Mutex::new(None),
                active_name: RwLock::new(None),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                initialized: AtomicBool::new(false),
                monitor: Mutex::new(None),
                metrics,
            }),
        }
    }

    /// Manager tunables.
    pub fn settings(&self) -> &FallbackSettings {
        &self.inner.settings
    }

    /// Register `protocol`. A protocol with the same name is replaced.
    pub fn add_protocol(&self, protocol: Arc<dyn FallbackProtocol>, priority: u8) {
        let mut protocols = self.inner.protocols.write();
        protocols.retain(|entry| entry.protocol.name() != protocol.name());
        let position = protocols
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(protocols.len());
        debug!(protocol = protocol.name(), priority, "registered fallback protocol");
        protocols.insert(position, Registered { priority, protocol });
    }

    /// Registered protocol names, highest priority first.
    pub fn protocol_names(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(|entry| entry.protocol.name()).collect()
    }

    /// Whether `initialize` brought up at least one protocol.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Name of the pinned protocol.
    pub fn active_protocol_name(&self) -> Option<&'static str> {
        *self.inner.active_name.read()
    }

    /// Receiver of everything the protocols hand in. Yields `Some` once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<FallbackMessage>> {
        self.inner.inbound_rx.lock().take()
    }

    /// Build a message carrying the configured attempt budget and TTL.
    pub fn new_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        message_type: &str,
        payload: serde_json::Value,
    ) -> FallbackMessage {
        FallbackMessage::new(sender_id, recipient_id, message_type, payload)
            .with_max_retries(self.inner.settings.max_retries)
            .with_ttl(self.inner.settings.message_ttl)
    }

    fn snapshot(&self) -> Vec<Registered> {
        self.inner.protocols.read().clone()
    }

    fn find(&self, name: &str) -> Option<Arc<dyn FallbackProtocol>> {
        self.snapshot()
            .into_iter()
            .find(|entry| entry.protocol.name() == name)
            .map(|entry| entry.protocol)
    }

    /// Initialize every protocol, then pin the first healthy one. Protocols
    /// that fail to initialize are logged and left out. Idempotent.
    pub async fn initialize(&self) -> Result<(), FallbackError> {
        if self.is_initialized() {
            return Ok(());
        }
        let mut ready = 0usize;
        for entry in self.snapshot() {
            match entry.protocol.initialize(self.inner.inbound_tx.clone()).await {
                Ok(()) => ready += 1,
                Err(err) => warn!(
                    protocol = entry.protocol.name(),
                    error = %err,
                    "fallback protocol failed to initialize"
                ),
            }
        }
        if ready == 0 {
            warn!("no fallback protocol could be initialized");
            return Err(FallbackError::NoActiveProtocol);
        }
        self.inner.initialized.store(true, Ordering::SeqCst);
        let active = self.select_active().await;
        info!(ready, active = active.unwrap_or("none"), "fallback manager initialized");
        Ok(())
    }

    /// Spawn the periodic health probe. Idempotent.
    pub fn start_monitor(&self) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.health_check_interval;
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                FallbackManager { inner }.select_active().await;
            }
        }));
    }

    /// Start the listener of every initialized protocol, then pin the
    /// highest priority healthy one as active.
    ///
    /// Every protocol keeps listening whether pinned or not: a sender may
    /// reach this node over any protocol once it cascades past an
    /// unreachable recipient. Listeners that failed to start are retried on
    /// each call.
    pub async fn select_active(&self) -> Option<&'static str> {
        if !self.is_initialized() {
            return None;
        }
        let mut active = self.inner.active.lock().await;
        let mut chosen = None;
        for entry in self.snapshot() {
            let name = entry.protocol.name();
            if let Err(err) = entry.protocol.start_listening().await {
                debug!(protocol = name, error = %err, "fallback listener not running");
                continue;
            }
            if chosen.is_none() && entry.protocol.health_check().await {
                chosen = Some(name);
            }
        }

        if chosen != *active {
            let previous = *active;
            match chosen {
                Some(name) => info!(
                    from = previous.unwrap_or("none"),
                    to = name,
                    "active fallback protocol changed"
                ),
                None => warn!(
                    from = previous.unwrap_or("none"),
                    "no healthy fallback protocol"
                ),
            }
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_fallback_switch(previous, chosen);
            }
            *active = chosen;
            *self.inner.active_name.write() = chosen;
        }
        chosen
    }

    async fn current_or_select(&self) -> Option<Arc<dyn FallbackProtocol>> {
        let current = *self.inner.active.lock().await;
        let name = match current {
            Some(name) => Some(name),
            None => self.select_active().await,
        };
        name.and_then(|name| self.find(name))
    }

    async fn try_send(&self, protocol: &Arc<dyn FallbackProtocol>, message: &FallbackMessage) -> Result<(), FallbackError> {
        let started = Instant::now();
        let outcome = protocol.send(message).await;
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_fallback_send(protocol.name(), outcome.is_ok(), started.elapsed());
        }
        outcome
    }

    /// Hand `message` to the active protocol. A recipient unreachable over
    /// the active protocol is tried on the remaining healthy protocols in
    /// priority order. Failed attempts are retried after `retry_delay`,
    /// re-selecting the active protocol first, until `message.max_retries`
    /// attempts are spent. Returns the protocol that took the message.
    pub async fn send(&self, message: FallbackMessage) -> Result<&'static str, FallbackError> {
        if !self.is_initialized() {
            return Err(FallbackError::NotInitialized("fallback manager"));
        }
        let mut message = message;
        let attempts = message.max_retries.max(1);
        let mut last_error = FallbackError::NoActiveProtocol;

        while message.retry_count < attempts {
            if message.is_expired() {
                return Err(FallbackError::Expired(message.id));
            }
            if message.retry_count > 0 {
                tokio::time::sleep(self.inner.settings.retry_delay).await;
                self.select_active().await;
            }

            match self.current_or_select().await {
                None => last_error = FallbackError::NoActiveProtocol,
                Some(active) => match self.try_send(&active, &message).await {
                    Ok(()) => {
                        debug!(protocol = active.name(), message_id = %message.id, "fallback hand-off");
                        return Ok(active.name());
                    }
                    Err(FallbackError::PeerUnreachable { protocol, recipient }) => {
                        debug!(protocol, recipient = %recipient, "recipient unreachable; trying other protocols");
                        last_error = FallbackError::PeerUnreachable { protocol, recipient };
                        for entry in self.snapshot() {
                            let candidate = entry.protocol;
                            if candidate.name() == active.name() || !candidate.health_check().await {
                                continue;
                            }
                            match self.try_send(&candidate, &message).await {
                                Ok(()) => {
                                    debug!(
                                        protocol = candidate.name(),
                                        message_id = %message.id,
                                        "fallback hand-off via secondary protocol"
                                    );
                                    return Ok(candidate.name());
                                }
                                Err(err) => last_error = err,
                            }
                        }
                    }
                    Err(err) => {
                        warn!(protocol = active.name(), message_id = %message.id, error = %err, "fallback send failed");
                        last_error = err;
                    }
                },
            }
            message.retry_count += 1;
        }

        warn!(
            message_id = %message.id,
            recipient = %message.recipient_id,
            attempts,
            error = %last_error,
            "fallback delivery exhausted"
        );
        Err(FallbackError::Exhausted {
            attempts,
            last_error: last_error.to_string(),
        })
    }

    /// Snapshot for status endpoints.
    pub fn status(&self) -> FallbackStatus {
        FallbackStatus {
            initialized: self.is_initialized(),
            active_protocol: self.active_protocol_name().map(str::to_string),
            protocols: self
                .snapshot()
                .into_iter()
                .map(|entry| ProtocolReport {
                    name: entry.protocol.name().to_string(),
                    priority: entry.priority,
                    status: entry.protocol.status(),
                    stats: entry.protocol.stats(),
                })
                .collect(),
        }
    }

    /// Stop the monitor and every protocol.
    pub async fn shutdown(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
        let mut active = self.inner.active.lock().await;
        for entry in self.snapshot() {
            entry.protocol.shutdown().await;
        }
        *active = None;
        *self.inner.active_name.write() = None;
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("fallback manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::{InMemoryProtocol, MemoryHub, ProtocolCore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Protocol whose health and send outcome are driven by the test.
    struct Scripted {
        name: &'static str,
        healthy: AtomicBool,
        unreachable: AtomicBool,
        listening: AtomicBool,
        refuse_listen: AtomicBool,
        sends: AtomicUsize,
        core: ProtocolCore,
    }

    impl Scripted {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                healthy: AtomicBool::new(true),
                unreachable: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                refuse_listen: AtomicBool::new(false),
                sends: AtomicUsize::new(0),
                core: ProtocolCore::new(name),
            })
        }
    }

    #[async_trait]
    impl FallbackProtocol for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn initialize(&self, sink: InboundSink) -> Result<(), FallbackError> {
            self.core.attach(sink);
            Ok(())
        }

        async fn send(&self, message: &FallbackMessage) -> Result<(), FallbackError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(FallbackError::PeerUnreachable {
                    protocol: self.name,
                    recipient: message.recipient_id.clone(),
                });
            }
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(FallbackError::Http("down".into()));
            }
            Ok(())
        }

        async fn start_listening(&self) -> Result<(), FallbackError> {
            if self.refuse_listen.load(Ordering::SeqCst) {
                return Err(FallbackError::Io(std::io::Error::from(std::io::ErrorKind::AddrInUse)));
            }
            self.listening.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_listening(&self) {
            self.listening.store(false, Ordering::SeqCst);
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn status(&self) -> ProtocolStatus {
            self.core.status()
        }

        fn stats(&self) -> ProtocolStats {
            self.core.stats()
        }
    }

    fn settings() -> FallbackSettings {
        FallbackSettings {
            health_check_interval: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            message_ttl: Duration::from_secs(3600),
        }
    }

    fn message(manager: &FallbackManager) -> FallbackMessage {
        manager.new_message("alpha", "beta", "hsp_message", json!({}))
    }

    #[tokio::test(start_paused = true)]
    async fn pins_highest_priority_healthy_protocol() {
        let manager = FallbackManager::new(settings(), None);
        let low = Scripted::new("low");
        let high = Scripted::new("high");
        manager.add_protocol(low.clone(), 1);
        manager.add_protocol(high.clone(), 3);
        assert_eq!(manager.protocol_names(), vec!["high", "low"]);

        manager.initialize().await.unwrap();
        assert_eq!(manager.active_protocol_name(), Some("high"));
        assert!(high.listening.load(Ordering::SeqCst));
        assert!(low.listening.load(Ordering::SeqCst));

        high.healthy.store(false, Ordering::SeqCst);
        assert_eq!(manager.select_active().await, Some("low"));
        assert!(high.listening.load(Ordering::SeqCst));

        high.healthy.store(true, Ordering::SeqCst);
        assert_eq!(manager.select_active().await, Some("high"));
        assert!(low.listening.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn listener_that_failed_to_start_is_retried() {
        let manager = FallbackManager::new(settings(), None);
        let low = Scripted::new("low");
        let high = Scripted::new("high");
        high.refuse_listen.store(true, Ordering::SeqCst);
        manager.add_protocol(low.clone(), 1);
        manager.add_protocol(high.clone(), 3);

        manager.initialize().await.unwrap();
        assert_eq!(manager.active_protocol_name(), Some("low"));
        assert!(!high.listening.load(Ordering::SeqCst));

        high.refuse_listen.store(false, Ordering::SeqCst);
        assert_eq!(manager.select_active().await, Some("high"));
        assert!(high.listening.load(Ordering::SeqCst));
        assert!(low.listening.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_reselects_before_retrying() {
        let manager = FallbackManager::new(settings(), None);
        let low = Scripted::new("low");
        let high = Scripted::new("high");
        manager.add_protocol(low.clone(), 1);
        manager.add_protocol(high.clone(), 3);
        manager.initialize().await.unwrap();

        high.healthy.store(false, Ordering::SeqCst);
        let used = manager.send(message(&manager)).await.unwrap();
        assert_eq!(used, "low");
        assert_eq!(high.sends.load(Ordering::SeqCst), 1);
        assert_eq!(low.sends.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_protocol_name(), Some("low"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_peer_cascades_within_one_attempt() {
        let manager = FallbackManager::new(settings(), None);
        let low = Scripted::new("low");
        let high = Scripted::new("high");
        manager.add_protocol(low.clone(), 1);
        manager.add_protocol(high.clone(), 3);
        manager.initialize().await.unwrap();

        high.unreachable.store(true, Ordering::SeqCst);
        let started = Instant::now();
        assert_eq!(manager.send(message(&manager)).await.unwrap(), "low");
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(manager.active_protocol_name(), Some("high"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_budget() {
        let manager = FallbackManager::new(settings(), None);
        let only = Scripted::new("only");
        manager.add_protocol(only.clone(), 1);
        manager.initialize().await.unwrap();
        only.unreachable.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let err = manager.send(message(&manager)).await.unwrap_err();
        assert!(matches!(err, FallbackError::Exhausted { attempts: 3, .. }));
        assert_eq!(only.sends.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn refuses_before_initialize_and_expired_messages() {
        let manager = FallbackManager::new(settings(), None);
        let only = Scripted::new("only");
        manager.add_protocol(only.clone(), 1);
        assert!(matches!(
            manager.send(message(&manager)).await,
            Err(FallbackError::NotInitialized(_))
        ));
        manager.initialize().await.unwrap();

        let mut stale = message(&manager).with_ttl(Duration::from_secs(1));
        stale.enqueued_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        assert!(matches!(manager.send(stale).await, Err(FallbackError::Expired(_))));
        assert_eq!(only.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn memory_nodes_exchange_through_managers() {
        let hub = MemoryHub::new();
        let alpha = FallbackManager::new(settings(), None);
        alpha.add_protocol(Arc::new(InMemoryProtocol::new("alpha", hub.clone())), 1);
        let beta = FallbackManager::new(settings(), None);
        beta.add_protocol(Arc::new(InMemoryProtocol::new("beta", hub.clone())), 1);
        alpha.initialize().await.unwrap();
        beta.initialize().await.unwrap();
        let mut inbound = beta.take_inbound().unwrap();
        assert!(beta.take_inbound().is_none());

        assert_eq!(alpha.send(message(&alpha)).await.unwrap(), "memory");
        let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sender_id, "alpha");

        let status = alpha.status();
        assert_eq!(status.active_protocol.as_deref(), Some("memory"));
        assert_eq!(status.protocols[0].stats.messages_sent, 1);

        alpha.shutdown().await;
        assert!(!alpha.is_initialized());
        assert!(alpha.active_protocol_name().is_none());
        assert_eq!(hub.nodes(), vec!["beta".to_string()]);
    }
}

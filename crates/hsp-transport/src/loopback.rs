//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Transport implementations for the messaging bridge."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! In-process broker and transport implementing [`TransportAdapter`].
//!
//! [`LoopbackBroker`] routes every publish to the connected endpoints whose
//! filters match, delivering through each endpoint's dispatcher. It can be
//! scripted to refuse connects, fail publishes or go offline entirely; taking
//! it offline drops every live link and bringing it back restores those links,
//! which mirrors an adapter reconnecting on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::adapter::{
    DeliveryQos, InboundDispatch, InboundHandler, InboundMessage, LinkFlag, TransportAdapter,
};
use crate::error::TransportError;
use crate::topic::topic_matches;

/// A publish accepted by the loopback broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
}

struct Endpoint {
    client_id: String,
    connected: bool,
    dropped: bool,
    filters: Vec<String>,
    sender: Option<mpsc::UnboundedSender<InboundMessage>>,
    link: Arc<LinkFlag>,
}

struct BrokerState {
    online: bool,
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    fail_connects: u32,
    fail_publishes: u32,
    connect_attempts: Vec<(String, Instant)>,
    publish_attempts: u64,
    published: Vec<PublishedRecord>,
}

/// Scriptable in-process broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackBroker")
            .field("online", &state.online)
            .field("endpoints", &state.endpoints.len())
            .field("published", &state.published.len())
            .finish()
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                next_id: 1,
                endpoints: HashMap::new(),
                fail_connects: 0,
                fail_publishes: 0,
                connect_attempts: Vec::new(),
                publish_attempts: 0,
                published: Vec::new(),
            })),
        }
    }

    /// Create a transport endpoint attached to this broker.
    pub fn endpoint(&self, client_id: impl Into<String>) -> LoopbackTransport {
        let client_id = client_id.into();
        let link = Arc::new(LinkFlag::new("loopback"));
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.endpoints.insert(
            id,
            Endpoint {
                client_id: client_id.clone(),
                connected: false,
                dropped: false,
                filters: Vec::new(),
                sender: None,
                link: Arc::clone(&link),
            },
        );
        LoopbackTransport {
            broker: self.clone(),
            id,
            client_id,
            link,
            inbound: InboundDispatch::new("loopback"),
        }
    }

    /// Take the broker offline or bring it back.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        if state.online == online {
            return;
        }
        state.online = online;
        for endpoint in state.endpoints.values_mut() {
            if online && endpoint.dropped {
                endpoint.dropped = false;
                endpoint.connected = true;
                endpoint.link.set(true);
            } else if !online && endpoint.connected {
                endpoint.connected = false;
                endpoint.dropped = true;
                endpoint.link.set(false);
            }
        }
        debug!(online, "loopback broker availability changed");
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_connects = count;
    }

    /// Fail the next `count` publishes, whichever endpoint issues them.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().fail_publishes = count;
    }

    /// Total connection attempts seen, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts.len()
    }

    /// Instants of every connection attempt, oldest first.
    pub fn connect_attempt_times(&self) -> Vec<Instant> {
        self.state
            .lock()
            .connect_attempts
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    /// Total publish attempts seen, including refused ones.
    pub fn publish_attempts(&self) -> u64 {
        self.state.lock().publish_attempts
    }

    /// Every accepted publish, in order.
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.state.lock().published.clone()
    }

    /// Accepted publishes whose topic matches `filter`.
    pub fn published_on(&self, filter: &str) -> Vec<PublishedRecord> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|record| topic_matches(filter, &record.topic))
            .cloned()
            .collect()
    }

    /// Client ids of the endpoints currently connected.
    pub fn connected_clients(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut clients: Vec<String> = state
            .endpoints
            .values()
            .filter(|endpoint| endpoint.connected)
            .map(|endpoint| endpoint.client_id.clone())
            .collect();
        clients.sort();
        clients
    }
}

/// Endpoint of a [`LoopbackBroker`].
pub struct LoopbackTransport {
    broker: LoopbackBroker,
    id: u64,
    client_id: String,
    link: Arc<LinkFlag>,
    inbound: InboundDispatch,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("client_id", &self.client_id)
            .field("connected", &self.link.get())
            .finish()
    }
}

impl LoopbackTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker(&self) -> &LoopbackBroker {
        &self.broker
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.broker.state.lock().endpoints.remove(&self.id);
    }
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self, _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state
            .connect_attempts
            .push((self.client_id.clone(), Instant::now()));
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Network("connection refused".into()));
        }
        if !state.online {
            return Err(TransportError::Network("broker unreachable".into()));
        }
        let sender = self.inbound.sender();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        endpoint.connected = true;
        endpoint.dropped = false;
        endpoint.sender = Some(sender);
        drop(state);
        self.link.set(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
                endpoint.connected = false;
                endpoint.dropped = false;
                endpoint.sender = None;
            }
        }
        self.inbound.stop();
        self.link.set(false);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: DeliveryQos) -> Result<(), TransportError> {
        let targets = {
            let mut state = self.broker.state.lock();
            state.publish_attempts += 1;
            let connected = state
                .endpoints
                .get(&self.id)
                .map(|endpoint| endpoint.connected)
                .unwrap_or(false);
            if !connected {
                return Err(TransportError::NotConnected);
            }
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(TransportError::Network("publish rejected".into()));
            }
            state.published.push(PublishedRecord {
                client_id: self.client_id.clone(),
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
            state
                .endpoints
                .values()
                .filter(|endpoint| {
                    endpoint.connected
                        && endpoint
                            .filters
                            .iter()
                            .any(|filter| topic_matches(filter, topic))
                })
                .filter_map(|endpoint| endpoint.sender.clone())
                .collect::<Vec<_>>()
        };
        for target in targets {
            let _ = target.send(InboundMessage {
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        if !endpoint.filters.iter().any(|existing| existing == filter) {
            endpoint.filters.push(filter.to_owned());
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
            endpoint.filters.retain(|existing| existing != filter);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.get()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    fn set_inbound(&self, handler: InboundHandler) {
        self.inbound.set_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::inbound_handler;

    fn collector(transport: &LoopbackTransport) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_inbound(inbound_handler(move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        }));
        rx
    }

    #[tokio::test]
    async fn routes_to_matching_subscribers_only() {
        let broker = LoopbackBroker::new();
        let alpha = broker.endpoint("alpha");
        let beta = broker.endpoint("beta");
        alpha.connect(Duration::from_secs(1)).await.unwrap();
        beta.connect(Duration::from_secs(1)).await.unwrap();
        beta.subscribe("hsp/knowledge/facts/#").await.unwrap();
        let mut inbox = collector(&beta);

        alpha
            .publish("hsp/knowledge/facts/weather", Bytes::from_static(b"1"), DeliveryQos::AtLeastOnce)
            .await
            .unwrap();
        alpha
            .publish("hsp/requests/gamma", Bytes::from_static(b"2"), DeliveryQos::AtLeastOnce)
            .await
            .unwrap();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.topic, "hsp/knowledge/facts/weather");
        assert!(inbox.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.published_on("hsp/requests/+").len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let broker = LoopbackBroker::new();
        let endpoint = broker.endpoint("alpha");
        broker.fail_next_connects(2);
        assert!(endpoint.connect(Duration::from_secs(1)).await.is_err());
        assert!(endpoint.connect(Duration::from_secs(1)).await.is_err());
        endpoint.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(broker.connect_attempts(), 3);

        broker.fail_next_publishes(1);
        let payload = Bytes::from_static(b"x");
        assert!(matches!(
            endpoint.publish("t", payload.clone(), DeliveryQos::AtLeastOnce).await,
            Err(TransportError::Network(_))
        ));
        endpoint.publish("t", payload, DeliveryQos::AtLeastOnce).await.unwrap();
        assert_eq!(broker.publish_attempts(), 2);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn offline_broker_drops_and_restores_links() {
        let broker = LoopbackBroker::new();
        let endpoint = broker.endpoint("alpha");
        endpoint.connect(Duration::from_secs(1)).await.unwrap();
        let mut link = endpoint.link_state();
        assert!(*link.borrow_and_update());

        broker.set_online(false);
        link.changed().await.unwrap();
        assert!(!*link.borrow_and_update());
        assert_eq!(
            endpoint
                .publish("t", Bytes::new(), DeliveryQos::AtMostOnce)
                .await
                .unwrap_err(),
            TransportError::NotConnected
        );
        assert!(endpoint.connect(Duration::from_secs(1)).await.is_err());

        broker.set_online(true);
        link.changed().await.unwrap();
        assert!(*link.borrow());
        assert_eq!(broker.connected_clients(), vec!["alpha".to_owned()]);
    }

    #[tokio::test]
    async fn explicit_disconnect_is_not_restored() {
        let broker = LoopbackBroker::new();
        let endpoint = broker.endpoint("alpha");
        endpoint.connect(Duration::from_secs(1)).await.unwrap();
        endpoint.disconnect().await.unwrap();
        broker.set_online(false);
        broker.set_online(true);
        assert!(!endpoint.is_connected());
        assert!(broker.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn inbound_messages_keep_publish_order() {
        let broker = LoopbackBroker::new();
        let sender = broker.endpoint("alpha");
        let receiver = broker.endpoint("beta");
        sender.connect(Duration::from_secs(1)).await.unwrap();
        receiver.connect(Duration::from_secs(1)).await.unwrap();
        receiver.subscribe("seq").await.unwrap();
        let mut inbox = collector(&receiver);
        for i in 0..20u8 {
            sender
                .publish("seq", Bytes::from(vec![i]), DeliveryQos::AtLeastOnce)
                .await
                .unwrap();
        }
        for i in 0..20u8 {
            assert_eq!(inbox.recv().await.unwrap().payload[0], i);
        }
    }
}

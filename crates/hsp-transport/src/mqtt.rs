//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Transport implementations for the messaging bridge."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! MQTT transport adapter built on `rumqttc`.
//!
//! A driver task owns the `EventLoop`. It forwards inbound publishes to the
//! dispatcher, re-applies every recorded subscription on each `ConnAck`, and
//! after a connection error sleeps for the [`ReconnectBackoff`] delay before
//! polling again, which makes `rumqttc` reconnect. Producers are never blocked
//! by the reconnect loop: a publish while the link is down fails fast with
//! [`TransportError::NotConnected`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hsp_common::BridgeConfig;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    DeliveryQos, InboundDispatch, InboundHandler, InboundMessage, LinkFlag, TransportAdapter,
};
use crate::backoff::ReconnectBackoff;
use crate::error::TransportError;

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Broker address and session parameters.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            host: config.broker.host.clone(),
            port: config.broker.port,
            client_id: config.client_id().to_owned(),
            keep_alive: config.broker.keep_alive,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(256 * 1024, 256 * 1024);
        options
    }
}

struct MqttInner {
    settings: MqttSettings,
    backoff: ReconnectBackoff,
    client: Mutex<Option<AsyncClient>>,
    subscriptions: Mutex<BTreeSet<String>>,
    link: LinkFlag,
    inbound: InboundDispatch,
    driver: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

/// [`TransportAdapter`] speaking MQTT 3.1.1.
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<MqttInner>,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("host", &self.inner.settings.host)
            .field("port", &self.inner.settings.port)
            .field("client_id", &self.inner.settings.client_id)
            .field("connected", &self.inner.link.get())
            .finish()
    }
}

impl MqttTransport {
    pub fn new(settings: MqttSettings, backoff: ReconnectBackoff) -> Self {
        Self {
            inner: Arc::new(MqttInner {
                settings,
                backoff,
                client: Mutex::new(None),
                subscriptions: Mutex::new(BTreeSet::new()),
                link: LinkFlag::new("mqtt"),
                inbound: InboundDispatch::new("mqtt"),
                driver: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            MqttSettings::from_config(config),
            ReconnectBackoff::from_config(&config.broker.reconnect),
        )
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.inner
            .client
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn stop_driver(&self) {
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
        self.inner.client.lock().take();
        self.inner.link.set(false);
    }
}

fn to_rumqtt_qos(qos: DeliveryQos) -> QoS {
    match qos {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
        DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn client_error(err: rumqttc::ClientError) -> TransportError {
    TransportError::Network(err.to_string())
}

async fn drive(
    inner: Arc<MqttInner>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) {
    let mut failures: u32 = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if connack.code != ConnectReturnCode::Success {
                    warn!(code = ?connack.code, "broker refused connection");
                    continue;
                }
                failures = 0;
                let filters: Vec<String> = inner.subscriptions.lock().iter().cloned().collect();
                for filter in filters {
                    if let Err(err) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        warn!(filter = %filter, error = %err, "failed to restore subscription");
                    }
                }
                info!(
                    host = %inner.settings.host,
                    port = inner.settings.port,
                    client_id = %inner.settings.client_id,
                    "mqtt connection acknowledged"
                );
                inner.link.set(true);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                };
                if inbound.send(message).is_err() {
                    debug!(topic = %publish.topic, "inbound dispatcher closed");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker sent disconnect");
                inner.link.set(false);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                inner.link.set(false);
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                inner.link.set(false);
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                let delay = inner.backoff.delay(failures);
                failures = failures.saturating_add(1);
                warn!(
                    error = %err,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "mqtt connection error; scheduling reconnect"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    debug!(client_id = %inner.settings.client_id, "mqtt driver stopped");
}

#[async_trait]
impl TransportAdapter for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.inner.link.get() {
            return Ok(());
        }
        self.stop_driver();
        self.inner.stopping.store(false, Ordering::SeqCst);

        let (client, eventloop) = AsyncClient::new(self.inner.settings.options(), REQUEST_CHANNEL_CAPACITY);
        *self.inner.client.lock() = Some(client.clone());
        let mut link = self.inner.link.subscribe();
        let driver = tokio::spawn(drive(
            Arc::clone(&self.inner),
            client,
            eventloop,
            self.inner.inbound.sender(),
        ));
        *self.inner.driver.lock() = Some(driver);

        info!(
            host = %self.inner.settings.host,
            port = self.inner.settings.port,
            "connecting to mqtt broker"
        );
        let outcome = match tokio::time::timeout(timeout, link.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => {
                self.stop_driver();
                Err(TransportError::Closed)
            }
            Err(_) => {
                self.stop_driver();
                Err(TransportError::Timeout(timeout))
            }
        };
        outcome
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let client = self.inner.client.lock().take();
        if let Some(client) = client {
            if let Err(err) = client.disconnect().await {
                debug!(error = %err, "mqtt disconnect request failed");
            }
        }
        let driver = self.inner.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.inner.inbound.stop();
        self.inner.link.set(false);
        info!(client_id = %self.inner.settings.client_id, "mqtt transport disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: DeliveryQos) -> Result<(), TransportError> {
        if !self.inner.link.get() {
            return Err(TransportError::NotConnected);
        }
        let client = self.client()?;
        client
            .publish(topic, to_rumqtt_qos(qos), false, payload.to_vec())
            .await
            .map_err(client_error)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let added = self.inner.subscriptions.lock().insert(filter.to_owned());
        if added && self.inner.link.get() {
            self.client()?
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(client_error)?;
        }
        debug!(filter = %filter, "mqtt subscription recorded");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let removed = self.inner.subscriptions.lock().remove(filter);
        if removed && self.inner.link.get() {
            self.client()?.unsubscribe(filter).await.map_err(client_error)?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.link.get()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.inner.link.subscribe()
    }

    fn set_inbound(&self, handler: InboundHandler) {
        self.inner.inbound.set_handler(handler);
    }
}

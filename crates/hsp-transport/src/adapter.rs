//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Transport implementations for the messaging bridge."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Raw message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Broker level delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryQos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// Callback receiving every inbound message of an adapter.
pub type InboundHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into an [`InboundHandler`].
pub fn inbound_handler<F, Fut>(handler: F) -> InboundHandler
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| handler(message).boxed())
}

/// Connection to a single external broker.
///
/// Implementations keep the subscription set across reconnects, report link
/// transitions through [`TransportAdapter::link_state`] and hand inbound
/// messages, one at a time and in arrival order, to the registered
/// [`InboundHandler`].
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short adapter name used in logs.
    fn name(&self) -> &'static str;

    /// Establish the connection, failing once `timeout` elapses.
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Close the connection. Automatic reconnects stop.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: DeliveryQos) -> Result<(), TransportError>;

    /// Add a topic filter. Recorded and re-applied after every reconnect.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Watch channel carrying `true` while the link is up.
    fn link_state(&self) -> watch::Receiver<bool>;

    /// Install the inbound callback, replacing any previous one.
    fn set_inbound(&self, handler: InboundHandler);
}

/// Inbound callback slot plus the task draining an adapter's receive queue.
///
/// Messages are pushed by the network side without waiting and handled
/// sequentially by the dispatcher, so a slow handler never stalls the broker
/// connection.
pub(crate) struct InboundDispatch {
    name: &'static str,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    sender: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InboundDispatch {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            handler: Arc::new(RwLock::new(None)),
            sender: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn set_handler(&self, handler: InboundHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Sender feeding the dispatcher, starting it on first use.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<InboundMessage> {
        let mut sender = self.sender.lock();
        if let Some(existing) = sender.as_ref() {
            if !existing.is_closed() {
                return existing.clone();
            }
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        let handler = Arc::clone(&self.handler);
        let name = self.name;
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let current = handler.read().clone();
                match current {
                    Some(callback) => callback(message).await,
                    None => debug!(
                        transport = name,
                        topic = %message.topic,
                        "no inbound handler installed; message discarded"
                    ),
                }
            }
            debug!(transport = name, "inbound dispatcher stopped");
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        *sender = Some(tx.clone());
        tx
    }

    pub(crate) fn stop(&self) {
        self.sender.lock().take();
    }
}

impl Drop for InboundDispatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Link flag shared between an adapter and its observers.
pub(crate) struct LinkFlag {
    name: &'static str,
    sender: watch::Sender<bool>,
}

impl LinkFlag {
    pub(crate) fn new(name: &'static str) -> Self {
        let (sender, _) = watch::channel(false);
        Self { name, sender }
    }

    pub(crate) fn set(&self, up: bool) {
        let changed = self.sender.send_if_modified(|current| {
            let changed = *current != up;
            *current = up;
            changed
        });
        if changed {
            if up {
                info!(transport = self.name, "transport link up");
            } else {
                warn!(transport = self.name, "transport link down");
            }
        }
    }

    pub(crate) fn get(&self) -> bool {
        *self.sender.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

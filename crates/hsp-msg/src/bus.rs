//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! In-process publish/subscribe router keyed by topic string.
//!
//! Handlers run one after another in registration order. Every invocation is
//! isolated: an error or a panic in one handler is logged and counted in the
//! [`DeliveryReport`] while the remaining handlers still receive the message.
//! Publishing takes a snapshot of the handler list, so subscribing or
//! unsubscribing from inside a handler (or from another task) never blocks or
//! invalidates an ongoing delivery.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Boxed handler invoked for every message published on a topic.
pub type Handler<M> = Arc<dyn Fn(M) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Token identifying a registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of delivering one message to the handlers of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Topic the message was published on.
    pub topic: String,
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

impl DeliveryReport {
    fn empty(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            delivered: 0,
            failed: 0,
        }
    }

    /// Whether any handler was registered at publish time.
    pub fn had_subscribers(&self) -> bool {
        self.delivered + self.failed > 0
    }
}

/// Completion handle returned by [`InternalBus::publish_async`].
#[derive(Debug)]
pub struct DeliveryHandle {
    topic: String,
    handlers: usize,
    task: JoinHandle<DeliveryReport>,
}

impl DeliveryHandle {
    /// Wait until every handler has finished.
    pub async fn wait(self) -> DeliveryReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                warn!(topic = %self.topic, error = %err, "bus delivery task aborted");
                DeliveryReport {
                    topic: self.topic,
                    delivered: 0,
                    failed: self.handlers,
                }
            }
        }
    }
}

struct BusInner<M> {
    next_id: AtomicU64,
    topics: RwLock<HashMap<String, Vec<(SubscriptionId, Handler<M>)>>>,
}

/// Topic keyed fan-out of messages to async handlers.
pub struct InternalBus<M> {
    inner: Arc<BusInner<M>>,
}

impl<M> Clone for InternalBus<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> std::fmt::Debug for InternalBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.inner.topics.read();
        f.debug_struct("InternalBus")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<M> Default for InternalBus<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> InternalBus<M>
where
    M: Clone + Send + 'static,
{
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an async closure on `topic`.
    pub fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler<M> = Arc::new(move |message| handler(message).boxed());
        self.subscribe_handler(topic, handler)
    }

    /// Register an already boxed handler on `topic`.
    pub fn subscribe_handler(&self, topic: impl Into<String>, handler: Handler<M>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        debug!(topic = %topic, subscription = id.0, "bus subscription added");
        self.inner
            .topics
            .write()
            .entry(topic)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a registration. Returns `false` when it was not present.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.inner.topics.write();
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Number of handlers currently registered on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn snapshot(&self, topic: &str) -> Vec<Handler<M>> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Deliver `message` to every current handler of `topic`, in order, and
    /// return once all of them finished.
    pub async fn publish(&self, topic: &str, message: M) -> DeliveryReport {
        let handlers = self.snapshot(topic);
        deliver(topic.to_owned(), handlers, message).await
    }

    /// Schedule delivery on the runtime without blocking the caller.
    ///
    /// The returned handle resolves once every handler has completed.
    pub fn publish_async(&self, topic: &str, message: M) -> DeliveryHandle {
        let handlers = self.snapshot(topic);
        let count = handlers.len();
        let owned_topic = topic.to_owned();
        let task = tokio::spawn(deliver(owned_topic.clone(), handlers, message));
        DeliveryHandle {
            topic: owned_topic,
            handlers: count,
            task,
        }
    }
}

async fn deliver<M>(topic: String, handlers: Vec<Handler<M>>, message: M) -> DeliveryReport
where
    M: Clone + Send + 'static,
{
    let mut report = DeliveryReport::empty(&topic);
    if handlers.is_empty() {
        debug!(topic = %topic, "no subscribers for bus topic");
        return report;
    }
    for (index, handler) in handlers.iter().enumerate() {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message.clone()))) {
            Ok(future) => future,
            Err(_) => {
                warn!(topic = %topic, handler = index, "bus handler panicked");
                report.failed += 1;
                continue;
            }
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => report.delivered += 1,
            Ok(Err(err)) => {
                warn!(topic = %topic, handler = index, error = %err, "bus handler failed");
                report.failed += 1;
            }
            Err(_) => {
                warn!(topic = %topic, handler = index, "bus handler panicked");
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let bus = InternalBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe("t", move |value: u32| {
                let seen = seen.clone();
                async move {
                    seen.lock().push((tag, value));
                    Ok(())
                }
            });
        }
        let report = bus.publish("t", 7).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_others() {
        let bus = InternalBus::<u32>::new();
        let hits = Arc::new(Mutex::new(0));
        bus.subscribe("t", |_| async { Err(anyhow::anyhow!("boom")) });
        bus.subscribe("t", |value: u32| async move {
            if value > 0 {
                panic!("handler bug");
            }
            Ok(())
        });
        let counter = hits.clone();
        bus.subscribe("t", move |_| {
            let counter = counter.clone();
            async move {
                *counter.lock() += 1;
                Ok(())
            }
        });
        let report = bus.publish("t", 1).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(*hits.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_async_resolves_after_handlers_finish() {
        let bus = InternalBus::<&'static str>::new();
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        bus.subscribe("slow", move |_| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                *flag.lock() = true;
                Ok(())
            }
        });
        let handle = bus.publish_async("slow", "payload");
        assert!(!*done.lock());
        let report = handle.wait().await;
        assert!(*done.lock());
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn unsubscribe_from_inside_handler_is_safe() {
        let bus = InternalBus::<u8>::new();
        let slot = Arc::new(Mutex::new(None));
        let bus_in_handler = bus.clone();
        let slot_in_handler = slot.clone();
        let id = bus.subscribe("once", move |_| {
            let bus = bus_in_handler.clone();
            let slot = slot_in_handler.clone();
            async move {
                if let Some(id) = slot.lock().take() {
                    bus.unsubscribe("once", id);
                }
                Ok(())
            }
        });
        *slot.lock() = Some(id);
        assert_eq!(bus.publish("once", 0).await.delivered, 1);
        assert_eq!(bus.subscriber_count("once"), 0);
        assert!(!bus.publish("once", 0).await.had_subscribers());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_returns_false() {
        let bus = InternalBus::<u8>::new();
        let id = bus.subscribe("a", |_| async { Ok(()) });
        assert!(!bus.unsubscribe("b", id));
        assert!(bus.unsubscribe("a", id));
        assert!(!bus.unsubscribe("a", id));
    }
}

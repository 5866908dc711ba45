//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{FallbackError, FallbackMessage, FallbackProtocol, InboundSink, ProtocolCore, ProtocolStats, ProtocolStatus};

const NAME: &str = "memory";

type Queue = mpsc::UnboundedReceiver<FallbackMessage>;

/// Rendezvous point for the nodes living in one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    nodes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<FallbackMessage>>>>,
}

impl MemoryHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Node ids currently registered.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.lock().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Whether `node_id` is registered.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.lock().contains_key(node_id)
    }

    fn register(&self, node_id: &str, queue: mpsc::UnboundedSender<FallbackMessage>) {
        self.nodes.lock().insert(node_id.to_string(), queue);
    }

    fn deregister(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
    }

    /// Queue `message` for its recipient, or for every node but `from` on
    /// broadcast. Returns the number of queues reached.
    fn route(&self, from: &str, message: &FallbackMessage) -> usize {
        let nodes = self.nodes.lock();
        if message.is_broadcast() {
            nodes
                .iter()
                .filter(|(node, _)| node.as_str() != from)
                .filter(|(_, queue)| queue.send(message.clone()).is_ok())
                .count()
        } else {
            nodes
                .get(&message.recipient_id)
                .map(|queue| usize::from(queue.send(message.clone()).is_ok()))
                .unwrap_or(0)
        }
    }
}

struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Queue>,
}

/// In-process queue. Always healthy once initialized; reaches only nodes
/// registered on the same [`MemoryHub`].
pub struct InMemoryProtocol {
    node_id: String,
    hub: MemoryHub,
    core: Arc<ProtocolCore>,
    queue: Mutex<Option<Queue>>,
    listener: Mutex<Option<Listener>>,
}

impl InMemoryProtocol {
    /// Protocol for `node_id` attached to `hub`.
    pub fn new(node_id: impl Into<String>, hub: MemoryHub) -> Self {
        Self {
            node_id: node_id.into(),
            hub,
            core: Arc::new(ProtocolCore::new(NAME)),
            queue: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Shared hub.
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl std::fmt::Debug for InMemoryProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProtocol")
            .field("node_id", &self.node_id)
            .field("status", &self.core.status())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FallbackProtocol for InMemoryProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn initialize(&self, sink: InboundSink) -> Result<(), FallbackError> {
        if !self.hub.contains(&self.node_id) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.hub.register(&self.node_id, tx);
            *self.queue.lock() = Some(rx);
        }
        self.core.attach(sink);
        info!(protocol = NAME, node_id = %self.node_id, "fallback protocol initialized");
        Ok(())
    }

    async fn send(&self, message: &FallbackMessage) -> Result<(), FallbackError> {
        if !self.core.is_initialized() {
            return Err(FallbackError::NotInitialized(NAME));
        }
        let reached = self.hub.route(&self.node_id, message);
        if reached == 0 {
            return Err(FallbackError::PeerUnreachable {
                protocol: NAME,
                recipient: message.recipient_id.clone(),
            });
        }
        debug!(protocol = NAME, message_id = %message.id, reached, "queued fallback message");
        self.core.record_sent();
        Ok(())
    }

    async fn start_listening(&self) -> Result<(), FallbackError> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }
        let mut queue = self
            .queue
            .lock()
            .take()
            .ok_or(FallbackError::NotInitialized(NAME))?;
        let (stop, mut stopped) = oneshot::channel();
        let core = Arc::clone(&self.core);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    next = queue.recv() => match next {
                        Some(message) => {
                            core.deliver(message);
                        }
                        None => break,
                    },
                }
            }
            queue
        });
        *listener = Some(Listener { stop, task });
        Ok(())
    }

    async fn stop_listening(&self) {
        let listener = self.listener.lock().take();
        if let Some(Listener { stop, task }) = listener {
            let _ = stop.send(());
            if let Ok(queue) = task.await {
                *self.queue.lock() = Some(queue);
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.core.is_initialized() && self.hub.contains(&self.node_id)
    }

    fn status(&self) -> ProtocolStatus {
        self.core.status()
    }

    fn stats(&self) -> ProtocolStats {
        self.core.stats()
    }

    async fn shutdown(&self) {
        self.stop_listening().await;
        self.hub.deregister(&self.node_id);
        self.queue.lock().take();
        self.core.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn node(hub: &MemoryHub, id: &str) -> (InMemoryProtocol, mpsc::UnboundedReceiver<FallbackMessage>) {
        let protocol = InMemoryProtocol::new(id, hub.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        protocol.initialize(tx).await.unwrap();
        (protocol, rx)
    }

    #[tokio::test]
    async fn lone_node_has_no_peer() {
        let hub = MemoryHub::new();
        let (alpha, _rx) = node(&hub, "alpha").await;
        assert!(alpha.health_check().await);
        let err = alpha
            .send(&FallbackMessage::new("alpha", "beta", "t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::PeerUnreachable { .. }));
        let err = alpha
            .send(&FallbackMessage::new("alpha", "all", "t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn queued_messages_survive_listener_restart() {
        let hub = MemoryHub::new();
        let (alpha, _alpha_rx) = node(&hub, "alpha").await;
        let (beta, mut beta_rx) = node(&hub, "beta").await;

        alpha
            .send(&FallbackMessage::new("alpha", "beta", "t", json!({"n": 1})))
            .await
            .unwrap();
        beta.start_listening().await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), beta_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload["n"], 1);

        beta.stop_listening().await;
        alpha
            .send(&FallbackMessage::new("alpha", "all", "t", json!({"n": 2})))
            .await
            .unwrap();
        assert!(beta_rx.try_recv().is_err());
        beta.start_listening().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), beta_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload["n"], 2);
        assert_eq!(alpha.stats().messages_sent, 2);
        assert_eq!(beta.stats().messages_received, 2);
    }

    #[tokio::test]
    async fn shutdown_leaves_the_hub() {
        let hub = MemoryHub::new();
        let (alpha, _rx) = node(&hub, "alpha").await;
        assert_eq!(hub.nodes(), vec!["alpha".to_string()]);
        alpha.shutdown().await;
        assert!(hub.nodes().is_empty());
        assert!(!alpha.health_check().await);
        assert_eq!(alpha.status(), ProtocolStatus::Disabled);
    }
}

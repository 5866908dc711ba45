//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! HTTP push fallback.
//!
//! Each node serves `POST /message` and `GET /health` and delivers to peers
//! registered by node id. A bind failure marks the protocol failed until a
//! later `start_listening` binds successfully.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hsp_common::HttpProtocolConfig;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{FallbackError, FallbackMessage, FallbackProtocol, InboundSink, ProtocolCore, ProtocolStats, ProtocolStatus};

const NAME: &str = "http";

#[derive(Clone)]
struct ServerState {
    node_id: Arc<str>,
    core: Arc<ProtocolCore>,
}

struct Server {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// HTTP push endpoint. Peers are addressed by base URL; a message is
/// delivered with `POST {base}/message`.
pub struct HttpProtocol {
    node_id: String,
    host: String,
    port: u16,
    request_timeout: Duration,
    endpoints: RwLock<BTreeMap<String, Url>>,
    client: Mutex<Option<reqwest::Client>>,
    core: Arc<ProtocolCore>,
    server: Mutex<Option<Server>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpProtocol {
    /// Endpoint for `node_id` listening on `host:port` once started. Port 0
    /// picks a free port, see [`Self::local_addr`].
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16, request_timeout: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            request_timeout,
            endpoints: RwLock::new(BTreeMap::new()),
            client: Mutex::new(None),
            core: Arc::new(ProtocolCore::new(NAME)),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Build from the `[fallback.http]` section, registering its peers.
    pub fn from_config(node_id: impl Into<String>, config: &HttpProtocolConfig) -> Self {
        let protocol = Self::new(node_id, config.host.clone(), config.port, config.request_timeout);
        for (peer, url) in &config.peers {
            protocol.add_endpoint(peer.clone(), url.clone());
        }
        protocol
    }

    /// Register or replace the base URL of `node_id`.
    pub fn add_endpoint(&self, node_id: impl Into<String>, base: Url) {
        let node_id = node_id.into();
        debug!(protocol = NAME, peer = %node_id, url = %base, "registered fallback endpoint");
        self.endpoints.write().insert(node_id, base);
    }

    /// Forget `node_id`.
    pub fn remove_endpoint(&self, node_id: &str) -> bool {
        self.endpoints.write().remove(node_id).is_some()
    }

    /// Address the server is bound to while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn targets(&self, message: &FallbackMessage) -> Vec<(String, Url)> {
        let endpoints = self.endpoints.read();
        if message.is_broadcast() {
            endpoints
                .iter()
                .filter(|(peer, _)| peer.as_str() != self.node_id)
                .map(|(peer, url)| (peer.clone(), url.clone()))
                .collect()
        } else {
            endpoints
                .get(&message.recipient_id)
                .map(|url| vec![(message.recipient_id.clone(), url.clone())])
                .unwrap_or_default()
        }
    }
}

impl std::fmt::Debug for HttpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProtocol")
            .field("node_id", &self.node_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("status", &self.core.status())
            .finish_non_exhaustive()
    }
}

async fn receive_message(
    State(state): State<ServerState>,
    Json(message): Json<FallbackMessage>,
) -> (StatusCode, Json<Value>) {
    let message_id = message.id.clone();
    if state.core.deliver(message) {
        (StatusCode::OK, Json(json!({ "status": "received", "id": message_id })))
    } else {
        (StatusCode::ACCEPTED, Json(json!({ "status": "dropped", "id": message_id })))
    }
}

async fn health(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "status": state.core.status(),
        "node_id": &*state.node_id,
        "stats": state.core.stats(),
    }))
}

#[async_trait]
impl FallbackProtocol for HttpProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn initialize(&self, sink: InboundSink) -> Result<(), FallbackError> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|err| {
                self.core.set_status(ProtocolStatus::Failed);
                FallbackError::Http(err.to_string())
            })?;
        *self.client.lock() = Some(client);
        self.core.attach(sink);
        info!(
            protocol = NAME,
            node_id = %self.node_id,
            peers = self.endpoints.read().len(),
            "fallback protocol initialized"
        );
        Ok(())
    }

    async fn send(&self, message: &FallbackMessage) -> Result<(), FallbackError> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or(FallbackError::NotInitialized(NAME))?;
        let targets = self.targets(message);
        if targets.is_empty() {
            return Err(FallbackError::PeerUnreachable {
                protocol: NAME,
                recipient: message.recipient_id.clone(),
            });
        }

        let mut delivered = 0usize;
        let mut last_error = None;
        for (peer, base) in targets {
            let outcome = async {
                let url = base
                    .join("message")
                    .map_err(|err| FallbackError::Http(err.to_string()))?;
                let response = client
                    .post(url)
                    .json(message)
                    .send()
                    .await
                    .map_err(|err| FallbackError::Http(err.to_string()))?;
                if response.status().is_success() {
                    Ok::<(), FallbackError>(())
                } else {
                    Err(FallbackError::Http(format!(
                        "peer {} answered {}",
                        peer,
                        response.status()
                    )))
                }
            }
            .await;
            match outcome {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(protocol = NAME, peer = %peer, error = %err, "fallback post failed");
                    last_error = Some(err);
                }
            }
        }

        match (delivered, last_error) {
            (0, Some(err)) => {
                self.core.record_error();
                Err(err)
            }
            _ => {
                debug!(protocol = NAME, message_id = %message.id, delivered, "posted fallback message");
                self.core.record_sent();
                Ok(())
            }
        }
    }

    async fn start_listening(&self) -> Result<(), FallbackError> {
        if !self.core.is_initialized() {
            return Err(FallbackError::NotInitialized(NAME));
        }
        if self.server.lock().is_some() {
            return Ok(());
        }
        let listener = match tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(protocol = NAME, host = %self.host, port = self.port, error = %err, "bind failed");
                self.core.set_status(ProtocolStatus::Failed);
                return Err(err.into());
            }
        };
        let addr = listener.local_addr()?;
        if self.core.status() == ProtocolStatus::Failed {
            self.core.set_status(ProtocolStatus::Active);
        }
        let state = ServerState {
            node_id: Arc::from(self.node_id.as_str()),
            core: Arc::clone(&self.core),
        };
        let app = Router::new()
            .route("/message", post(receive_message))
            .route("/health", get(health))
            .with_state(state);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.await;
            };
            if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                warn!(protocol = NAME, error = %err, "fallback http server stopped");
            }
        });
        *self.local_addr.lock() = Some(addr);
        *self.server.lock() = Some(Server { stop, task });
        info!(protocol = NAME, %addr, "fallback http endpoint listening");
        Ok(())
    }

    async fn stop_listening(&self) {
        let server = self.server.lock().take();
        if let Some(Server { stop, task }) = server {
            let _ = stop.send(());
            let _ = task.await;
            *self.local_addr.lock() = None;
        }
    }

    async fn health_check(&self) -> bool {
        self.core.is_initialized()
            && self.client.lock().is_some()
            && self.core.status() != ProtocolStatus::Failed
    }

    fn status(&self) -> ProtocolStatus {
        self.core.status()
    }

    fn stats(&self) -> ProtocolStats {
        self.core.stats()
    }

    async fn shutdown(&self) {
        self.stop_listening().await;
        self.client.lock().take();
        self.core.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn endpoint(node: &str) -> (HttpProtocol, mpsc::UnboundedReceiver<FallbackMessage>) {
        let protocol = HttpProtocol::new(node, "127.0.0.1", 0, Duration::from_secs(2));
        let (tx, rx) = mpsc::unbounded_channel();
        protocol.initialize(tx).await.unwrap();
        (protocol, rx)
    }

    fn base_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    #[tokio::test]
    async fn posts_to_registered_peer() {
        let (alpha, _alpha_rx) = endpoint("alpha").await;
        let (beta, mut beta_rx) = endpoint("beta").await;
        beta.start_listening().await.unwrap();
        alpha.add_endpoint("beta", base_url(beta.local_addr().unwrap()));

        let message = FallbackMessage::new("alpha", "beta", "hsp_message", json!({"topic": "t"}));
        alpha.send(&message).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), beta_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message);
        assert_eq!(alpha.stats().messages_sent, 1);

        let health: Value = reqwest::get(format!("http://{}/health", beta.local_addr().unwrap()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["node_id"], "beta");
        assert_eq!(health["stats"]["messages_received"], 1);

        beta.shutdown().await;
        assert!(beta.local_addr().is_none());
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let (alpha, _rx) = endpoint("alpha").await;
        assert!(alpha.health_check().await);
        let err = alpha
            .send(&FallbackMessage::new("alpha", "beta", "t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::PeerUnreachable { protocol: "http", .. }));
    }

    #[tokio::test]
    async fn dead_peer_counts_as_error() {
        let (alpha, _rx) = endpoint("alpha").await;
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        alpha.add_endpoint("beta", base_url(addr));
        let err = alpha
            .send(&FallbackMessage::new("alpha", "beta", "t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Http(_)));
        assert_eq!(alpha.stats().errors, 1);
        assert_eq!(alpha.status(), ProtocolStatus::Degraded);
    }

    #[tokio::test]
    async fn recovers_after_failed_bind() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let protocol = HttpProtocol::new("alpha", "127.0.0.1", port, Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        protocol.initialize(tx).await.unwrap();

        assert!(matches!(protocol.start_listening().await, Err(FallbackError::Io(_))));
        assert_eq!(protocol.status(), ProtocolStatus::Failed);
        assert!(!protocol.health_check().await);

        drop(taken);
        protocol.start_listening().await.unwrap();
        assert_eq!(protocol.status(), ProtocolStatus::Active);
        assert!(protocol.health_check().await);
        assert_eq!(protocol.local_addr().map(|addr| addr.port()), Some(port));
        protocol.shutdown().await;
    }

    #[tokio::test]
    async fn uninitialized_endpoint_refuses_work() {
        let protocol = HttpProtocol::new("alpha", "127.0.0.1", 0, Duration::from_secs(1));
        assert!(!protocol.health_check().await);
        assert!(matches!(
            protocol.start_listening().await,
            Err(FallbackError::NotInitialized("http"))
        ));
    }
}

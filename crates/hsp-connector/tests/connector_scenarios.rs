//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "tests"
//! hsp_type: "test"
//! hsp_scope: "code"
//! hsp_description: "Connector orchestration over bridge, resilience and fallback."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hsp_common::{new_registry, BridgeConfig};
use hsp_connector::{
    AckOutcome, ConnectionState, Connector, ConnectorError, DeliveryPath, InboundPath,
};
use hsp_msg::{CapabilityAdvertisementPayload, FactPayload, TaskRequestPayload};
use hsp_resilience::{CircuitState, DegradationLevel, MemoryHub};
use hsp_transport::LoopbackBroker;
use serde_json::json;
use tokio::sync::mpsc;

fn config(node: &str) -> BridgeConfig {
    let mut config = BridgeConfig {
        node_id: node.to_owned(),
        ..BridgeConfig::default()
    };
    config.broker.reconnect.jitter = Duration::ZERO;
    config.ack.ack_timeout = Duration::from_secs(2);
    config.retry.initial_delay = Duration::from_millis(100);
    config.fallback.retry_delay = Duration::from_millis(10);
    config.fallback.max_retries = 2;
    config.fallback.file.enabled = false;
    config.fallback.http.enabled = false;
    config
}

fn node(broker: &LoopbackBroker, hub: &MemoryHub, config: BridgeConfig) -> Connector {
    let endpoint = broker.endpoint(config.node_id.clone());
    Connector::builder(config)
        .transport(Arc::new(endpoint))
        .memory_hub(hub.clone())
        .build()
        .unwrap()
}

fn request(id: &str, requester: &str) -> TaskRequestPayload {
    serde_json::from_value(json!({"request_id": id, "requester_ai_id": requester})).unwrap()
}

fn fact(id: &str) -> FactPayload {
    serde_json::from_value(json!({"id": id, "statement_type": "observation"})).unwrap()
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

#[tokio::test(start_paused = true)]
async fn acknowledged_request_round_trips_over_broker() {
    let broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let registry = new_registry();
    let alpha = Connector::builder(config("alpha"))
        .transport(Arc::new(broker.endpoint("alpha")))
        .memory_hub(hub.clone())
        .registry(registry.clone())
        .build()
        .unwrap();
    let beta = node(&broker, &hub, config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_task_request(move |request, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((request.request_id, message.path));
            Ok(())
        }
    })
    .unwrap();

    alpha.connect().await.unwrap();
    beta.connect().await.unwrap();
    assert_eq!(alpha.state(), ConnectionState::Connected);

    let (correlation_id, receipt) = alpha
        .send_task_request("beta", &request("r1", "alpha"))
        .await
        .unwrap();
    assert_eq!(receipt.path, DeliveryPath::Primary);
    assert!(receipt.acknowledged());
    assert_eq!(receipt.correlation_id, correlation_id);
    assert_eq!(recv(&mut rx).await, ("r1".to_owned(), InboundPath::Broker));
    assert_eq!(alpha.pending_acks(), 0);
    assert!(broker
        .published()
        .iter()
        .any(|record| record.client_id == "beta" && record.topic == "hsp/acks/alpha"));

    let names: Vec<String> = registry
        .gather()
        .iter()
        .map(|family| family.get_name().to_owned())
        .collect();
    assert!(names.iter().any(|name| name.starts_with("hsp_messages_")));
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_publish_returns_after_broker_accepts() {
    let broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let alpha = node(&broker, &hub, config("alpha"));
    let beta = node(&broker, &hub, config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_fact(move |fact, _| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(fact.id);
            Ok(())
        }
    })
    .unwrap();
    alpha.connect().await.unwrap();
    beta.connect().await.unwrap();

    let receipt = alpha.publish_fact(&fact("f1"), false).await.unwrap();
    assert_eq!(receipt.path, DeliveryPath::Primary);
    assert_eq!(receipt.ack, AckOutcome::NotRequested);
    assert_eq!(alpha.pending_acks(), 0);
    assert_eq!(recv(&mut rx).await, "f1");
    assert_eq!(broker.published_on("hsp/knowledge/facts/#").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_acknowledgement_hands_message_to_memory_fallback() {
    // Separate brokers: beta never sees alpha's broker traffic, and its
    // acknowledgement never reaches alpha.
    let alpha_broker = LoopbackBroker::new();
    let beta_broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let alpha = node(&alpha_broker, &hub, config("alpha"));
    let beta = node(&beta_broker, &hub, config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_task_request(move |request, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((request.request_id, message.path));
            Ok(())
        }
    })
    .unwrap();
    alpha.connect().await.unwrap();
    beta.connect().await.unwrap();

    let (_, receipt) = alpha
        .send_task_request("beta", &request("r2", "alpha"))
        .await
        .unwrap();
    assert_eq!(receipt.path, DeliveryPath::Fallback("memory"));
    assert_eq!(receipt.ack, AckOutcome::TimedOut);
    assert_eq!(recv(&mut rx).await, ("r2".to_owned(), InboundPath::Fallback));
    assert_eq!(alpha.pending_acks(), 0);
    assert_eq!(alpha.communication_status().level, DegradationLevel::Healthy);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_skips_the_broker() {
    let broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let mut alpha_config = config("alpha");
    alpha_config.retry.max_attempts = 1;
    alpha_config.circuit_breaker.failure_threshold = 1;
    let alpha = node(&broker, &hub, alpha_config);
    let beta = node(&broker, &hub, config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_fact(move |fact, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((fact.id, message.path));
            Ok(())
        }
    })
    .unwrap();
    alpha.connect().await.unwrap();
    beta.connect().await.unwrap();

    broker.fail_next_publishes(1);
    let first = alpha.publish_fact(&fact("f1"), false).await.unwrap();
    assert_eq!(first.path, DeliveryPath::Fallback("memory"));
    assert_eq!(broker.publish_attempts(), 1);
    assert_eq!(alpha.communication_status().circuit.state, CircuitState::Open);

    let second = alpha.publish_fact(&fact("f2"), false).await.unwrap();
    assert_eq!(second.path, DeliveryPath::Fallback("memory"));
    assert_eq!(broker.publish_attempts(), 1);

    assert_eq!(recv(&mut rx).await, ("f1".to_owned(), InboundPath::Fallback));
    assert_eq!(recv(&mut rx).await, ("f2".to_owned(), InboundPath::Fallback));
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_leaves_connector_degraded() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let hub = MemoryHub::new();
    let alpha = node(&broker, &hub, config("alpha"));

    let err = alpha.connect().await.unwrap_err();
    assert!(matches!(err, ConnectorError::ConnectFailed { attempts: 3, .. }));
    let times = broker.connect_attempt_times();
    assert_eq!(times.len(), 3);
    assert_eq!(times[1] - times[0], Duration::from_millis(500));
    assert_eq!(times[2] - times[1], Duration::from_millis(1000));

    assert_eq!(alpha.state(), ConnectionState::Disconnected);
    assert!(alpha.is_degraded());
    let status = alpha.communication_status();
    assert_eq!(status.level, DegradationLevel::Degraded);
    assert_eq!(
        status.fallback.unwrap().active_protocol.as_deref(),
        Some("memory")
    );

    let health = alpha.health_check().await;
    assert!(health.healthy);
    assert_eq!(health.fallback_protocol.as_deref(), Some("memory"));

    let err = alpha
        .send_task_request("ghost", &request("r3", "alpha"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::DeliveryFailure { .. }));
    assert_eq!(alpha.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_acknowledged_sends_resolve_independently() {
    let broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let alpha = node(&broker, &hub, config("alpha"));
    let beta = node(&broker, &hub, config("beta"));
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    beta.on_task_request(move |_, _| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();
    alpha.connect().await.unwrap();
    beta.connect().await.unwrap();

    let first = request("r4", "alpha");
    let second = request("r5", "alpha");
    let (a, b) = tokio::join!(
        alpha.send_task_request("beta", &first),
        alpha.send_task_request("beta", &second),
    );
    let (a_id, a) = a.unwrap();
    let (b_id, b) = b.unwrap();
    assert_ne!(a_id, b_id);
    assert!(a.acknowledged());
    assert!(b.acknowledged());
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(alpha.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn capabilities_are_readvertised_after_reconnect() {
    let broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let alpha = node(&broker, &hub, config("alpha"));
    let beta = node(&broker, &hub, config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_capability_advertisement(move |advert, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((advert.capability_id, message.path));
            Ok(())
        }
    })
    .unwrap();
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        alpha.on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects = Arc::clone(&disconnects);
        alpha.on_disconnect(move || {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let advert: CapabilityAdvertisementPayload = serde_json::from_value(json!({
        "capability_id": "alpha-summarize",
        "ai_id": "alpha",
        "name": "summarize"
    }))
    .unwrap();
    assert!(alpha.advertise_capability(advert).await.unwrap().is_none());

    beta.connect().await.unwrap();
    alpha.connect().await.unwrap();
    assert_eq!(
        recv(&mut rx).await,
        ("alpha-summarize".to_owned(), InboundPath::Broker)
    );

    broker.set_online(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alpha.state(), ConnectionState::Disconnected);
    assert!(alpha.is_degraded());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    broker.set_online(true);
    assert_eq!(
        recv(&mut rx).await,
        ("alpha-summarize".to_owned(), InboundPath::Broker)
    );
    assert_eq!(alpha.state(), ConnectionState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert!(!alpha.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn broker_down_at_startup_is_retried_in_background() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let hub = MemoryHub::new();
    let mut alpha_config = config("alpha");
    alpha_config.connect_attempts = 1;
    let alpha = node(&broker, &hub, alpha_config);
    let beta = node(&broker, &hub, config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_capability_advertisement(move |advert, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((advert.capability_id, message.path));
            Ok(())
        }
    })
    .unwrap();
    let connects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        alpha.on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        });
    }
    let advert: CapabilityAdvertisementPayload = serde_json::from_value(json!({
        "capability_id": "alpha-translate",
        "ai_id": "alpha",
        "name": "translate"
    }))
    .unwrap();
    assert!(alpha.advertise_capability(advert).await.unwrap().is_none());

    assert!(matches!(
        alpha.connect().await,
        Err(ConnectorError::ConnectFailed { attempts: 1, .. })
    ));
    assert!(alpha.is_degraded());

    broker.set_online(true);
    beta.connect().await.unwrap();
    assert_eq!(
        recv(&mut rx).await,
        ("alpha-translate".to_owned(), InboundPath::Broker)
    );
    assert_eq!(alpha.state(), ConnectionState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(!alpha.is_degraded());
    assert_eq!(
        alpha.communication_status().level,
        DegradationLevel::Healthy
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_new_work() {
    let broker = LoopbackBroker::new();
    let hub = MemoryHub::new();
    let alpha = node(&broker, &hub, config("alpha"));
    alpha.connect().await.unwrap();
    assert_eq!(broker.connected_clients(), vec!["alpha".to_owned()]);

    alpha.shutdown().await;
    assert_eq!(alpha.state(), ConnectionState::Disconnected);
    assert!(broker.connected_clients().is_empty());
    assert!(!hub.contains("alpha"));
    assert!(matches!(
        alpha.publish_fact(&fact("late"), false).await,
        Err(ConnectorError::ShuttingDown)
    ));
    assert!(matches!(alpha.connect().await, Err(ConnectorError::ShuttingDown)));
}

#[tokio::test]
async fn file_mailbox_carries_traffic_while_broker_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let hub = MemoryHub::new();

    let mailbox_config = |node: &str| {
        let mut config = config(node);
        config.connect_attempts = 1;
        config.fallback.memory.enabled = false;
        config.fallback.file.enabled = true;
        config.fallback.file.base_path = dir.path().to_path_buf();
        config.fallback.file.poll_interval = Duration::from_millis(20);
        config
    };
    let alpha = node(&broker, &hub, mailbox_config("alpha"));
    let beta = node(&broker, &hub, mailbox_config("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_fact(move |fact, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((fact.id, message.path, message.envelope.sender_id.clone()));
            Ok(())
        }
    })
    .unwrap();
    assert!(alpha.connect().await.is_err());
    assert!(beta.connect().await.is_err());

    let receipt = alpha.publish_fact(&fact("f9"), false).await.unwrap();
    assert_eq!(receipt.path, DeliveryPath::Fallback("file"));
    assert_eq!(
        recv(&mut rx).await,
        ("f9".to_owned(), InboundPath::Fallback, "alpha".to_owned())
    );

    alpha.shutdown().await;
    beta.shutdown().await;
}

fn offline_config(node: &str, mailbox: &std::path::Path) -> BridgeConfig {
    let mut config = config(node);
    config.connect_attempts = 1;
    config.fallback.file.enabled = true;
    config.fallback.file.base_path = mailbox.to_path_buf();
    config.fallback.file.poll_interval = Duration::from_millis(20);
    config.fallback.http.enabled = true;
    config.fallback.http.host = "127.0.0.1".to_owned();
    config.fallback.http.port = 0;
    config
}

#[tokio::test]
async fn recipient_without_http_entry_is_reached_through_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let hub = MemoryHub::new();

    let without_memory = |node: &str| {
        let mut config = offline_config(node, dir.path());
        config.fallback.memory.enabled = false;
        config
    };
    let alpha = node(&broker, &hub, without_memory("alpha"));
    let beta = node(&broker, &hub, without_memory("beta"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    beta.on_fact(move |fact, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((fact.id, message.path));
            Ok(())
        }
    })
    .unwrap();
    assert!(alpha.connect().await.is_err());
    assert!(beta.connect().await.is_err());
    assert_eq!(
        beta.communication_status().fallback.unwrap().active_protocol.as_deref(),
        Some("http")
    );

    let receipt = alpha.publish_fact(&fact("f10"), false).await.unwrap();
    assert_eq!(receipt.path, DeliveryPath::Fallback("file"));
    assert_eq!(recv(&mut rx).await, ("f10".to_owned(), InboundPath::Fallback));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn all_fallback_protocols_cooperate_while_broker_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let hub = MemoryHub::new();

    let alpha = node(&broker, &hub, offline_config("alpha", dir.path()));
    let beta = node(&broker, &hub, offline_config("beta", dir.path()));
    let gamma = node(&broker, &hub, offline_config("gamma", dir.path()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    for receiver in [&beta, &gamma] {
        let tx = tx.clone();
        let me = receiver.node_id().to_owned();
        receiver
            .on_task_request(move |request, message| {
                let tx = tx.clone();
                let me = me.clone();
                async move {
                    let _ = tx.send((me, request.request_id, message.path));
                    Ok(())
                }
            })
            .unwrap();
    }
    for connector in [&alpha, &beta, &gamma] {
        assert!(connector.connect().await.is_err());
        assert!(connector.is_degraded());
    }

    let beta_addr = beta.http_local_addr().expect("beta http endpoint listening");
    assert!(alpha.add_http_endpoint(
        "beta",
        url::Url::parse(&format!("http://{}/", beta_addr)).unwrap()
    ));

    let (_, to_beta) = alpha
        .send_task_request("beta", &request("r6", "alpha"))
        .await
        .unwrap();
    assert_eq!(to_beta.path, DeliveryPath::Fallback("http"));
    assert_eq!(
        recv(&mut rx).await,
        ("beta".to_owned(), "r6".to_owned(), InboundPath::Fallback)
    );

    let (_, to_gamma) = alpha
        .send_task_request("gamma", &request("r7", "alpha"))
        .await
        .unwrap();
    assert_eq!(to_gamma.path, DeliveryPath::Fallback("file"));
    assert_eq!(
        recv(&mut rx).await,
        ("gamma".to_owned(), "r7".to_owned(), InboundPath::Fallback)
    );

    let status = alpha.communication_status().fallback.unwrap();
    assert_eq!(status.active_protocol.as_deref(), Some("http"));
    let sent = |name: &str| {
        status
            .protocols
            .iter()
            .find(|protocol| protocol.name == name)
            .map(|protocol| protocol.stats.messages_sent)
    };
    assert_eq!(sent("http"), Some(1));
    assert_eq!(sent("file"), Some(1));
    assert_eq!(sent("memory"), Some(0));

    for connector in [&alpha, &beta, &gamma] {
        connector.shutdown().await;
    }
}

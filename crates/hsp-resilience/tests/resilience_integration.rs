//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "tests"
//! hsp_type: "test"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hsp_common::new_registry;
use hsp_resilience::{
    CircuitBreaker, CircuitError, CircuitState, DegradationLevel, DegradationTracker,
    FallbackManager, FallbackSettings, FileMailboxProtocol, InMemoryProtocol, MemoryHub,
    ResilienceMetrics, RetryPolicy,
};
use hsp_transport::{DeliveryQos, LoopbackBroker, TransportAdapter, TransportError};

fn settings() -> FallbackSettings {
    FallbackSettings {
        health_check_interval: Duration::from_secs(30),
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
        message_ttl: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn retry_inside_breaker_counts_one_failure_per_call() {
    let broker = LoopbackBroker::new();
    let transport = broker.endpoint("alpha");
    transport.connect(Duration::from_secs(1)).await.unwrap();

    let registry = new_registry();
    let metrics = ResilienceMetrics::new(&registry).unwrap();
    let retry = RetryPolicy::new(3, Duration::from_millis(50), 2.0, Duration::from_secs(1))
        .with_metrics(Some(metrics.clone()));
    let breaker = CircuitBreaker::new("primary", 2, Duration::from_secs(10)).with_metrics(Some(metrics));

    broker.set_online(false);
    for expected_attempts in [3u64, 6] {
        let result: Result<(), CircuitError<TransportError>> = breaker
            .call(|| {
                retry.execute("publish", |_| {
                    transport.publish("hsp/facts/general", Bytes::from_static(b"{}"), DeliveryQos::AtLeastOnce)
                })
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Inner(TransportError::NotConnected))));
        assert_eq!(broker.publish_attempts(), expected_attempts);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(), CircuitError<TransportError>> = breaker
        .call(|| {
            retry.execute("publish", |_| {
                transport.publish("hsp/facts/general", Bytes::from_static(b"{}"), DeliveryQos::AtLeastOnce)
            })
        })
        .await;
    assert!(rejected.unwrap_err().is_open());
    assert_eq!(broker.publish_attempts(), 6);

    broker.set_online(true);
    tokio::time::advance(Duration::from_secs(10)).await;
    let probe: Result<(), CircuitError<TransportError>> = breaker
        .call(|| {
            retry.execute("publish", |_| {
                transport.publish("hsp/facts/general", Bytes::from_static(b"{}"), DeliveryQos::AtLeastOnce)
            })
        })
        .await;
    assert!(probe.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);

    let names: Vec<String> = registry
        .gather()
        .iter()
        .map(|family| family.get_name().to_string())
        .collect();
    assert!(names.contains(&"hsp_resilience_circuit_transitions_total".to_string()));
    assert!(names.contains(&"hsp_resilience_retries_total".to_string()));
}

#[tokio::test]
async fn file_mailbox_takes_over_when_memory_has_no_peer() {
    let dir = tempfile::tempdir().unwrap();
    let hub = MemoryHub::new();

    let alpha = FallbackManager::new(settings(), None);
    alpha.add_protocol(Arc::new(InMemoryProtocol::new("alpha", hub.clone())), 2);
    alpha.add_protocol(
        Arc::new(FileMailboxProtocol::new("alpha", dir.path(), Duration::from_millis(20))),
        1,
    );
    let beta = FallbackManager::new(settings(), None);
    beta.add_protocol(
        Arc::new(FileMailboxProtocol::new("beta", dir.path(), Duration::from_millis(20))),
        1,
    );
    alpha.initialize().await.unwrap();
    beta.initialize().await.unwrap();
    assert_eq!(alpha.active_protocol_name(), Some("memory"));
    assert_eq!(beta.active_protocol_name(), Some("file"));
    let mut inbound = beta.take_inbound().unwrap();

    let message = alpha.new_message("alpha", "beta", "hsp_message", serde_json::json!({"topic": "t"}));
    assert_eq!(alpha.send(message.clone()).await.unwrap(), "file");
    let received = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id, message.id);
    assert_eq!(received.ttl, Some(Duration::from_secs(60)));

    let status = alpha.status();
    assert_eq!(status.active_protocol.as_deref(), Some("memory"));
    let file = status.protocols.iter().find(|p| p.name == "file").unwrap();
    assert_eq!(file.stats.messages_sent, 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn degradation_follows_primary_and_fallback() {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(&registry).unwrap();
    let mut tracker = DegradationTracker::new(Some(metrics));

    let hub = MemoryHub::new();
    let manager = FallbackManager::new(settings(), None);
    manager.add_protocol(Arc::new(InMemoryProtocol::new("alpha", hub)), 1);

    let offline = tracker.evaluate(false, manager.active_protocol_name());
    assert_eq!(offline.level, DegradationLevel::Offline);
    manager.initialize().await.unwrap();
    let degraded = tracker.evaluate(false, manager.active_protocol_name());
    assert_eq!(degraded.level, DegradationLevel::Degraded);
    assert_eq!(degraded.fallback_protocol.as_deref(), Some("memory"));
    let healthy = tracker.evaluate(true, manager.active_protocol_name());
    assert_eq!(healthy.level.as_str(), "healthy");
}

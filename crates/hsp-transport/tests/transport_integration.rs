//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "tests"
//! hsp_type: "test"
//! hsp_scope: "code"
//! hsp_description: "Adapter behaviour through the trait object seam."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hsp_transport::{inbound_handler, DeliveryQos, LoopbackBroker, TransportAdapter};
use tokio::sync::mpsc;

#[tokio::test]
async fn request_reply_over_trait_objects() {
    let broker = LoopbackBroker::new();
    let client: Arc<dyn TransportAdapter> = Arc::new(broker.endpoint("client"));
    let server: Arc<dyn TransportAdapter> = Arc::new(broker.endpoint("server"));

    client.connect(Duration::from_secs(1)).await.unwrap();
    server.connect(Duration::from_secs(1)).await.unwrap();
    client.subscribe("hsp/results/client").await.unwrap();
    server.subscribe("hsp/requests/server").await.unwrap();

    let responder = Arc::clone(&server);
    server.set_inbound(inbound_handler(move |message| {
        let responder = Arc::clone(&responder);
        async move {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&message.payload);
            responder
                .publish("hsp/results/client", Bytes::from(reply), DeliveryQos::AtLeastOnce)
                .await
                .expect("reply publish");
        }
    }));

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.set_inbound(inbound_handler(move |message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.payload);
        }
    }));

    client
        .publish("hsp/requests/server", Bytes::from_static(b"ping"), DeliveryQos::AtLeastOnce)
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("reply in time")
        .expect("channel open");
    assert_eq!(&reply[..], b"re:ping");
}

#[tokio::test]
async fn resubscription_survives_broker_outage() {
    let broker = LoopbackBroker::new();
    let publisher = broker.endpoint("publisher");
    let subscriber = broker.endpoint("subscriber");
    publisher.connect(Duration::from_secs(1)).await.unwrap();
    subscriber.connect(Duration::from_secs(1)).await.unwrap();
    subscriber.subscribe("hsp/acks/subscriber").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber.set_inbound(inbound_handler(move |message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.topic);
        }
    }));

    broker.set_online(false);
    broker.set_online(true);
    assert!(subscriber.is_connected());

    publisher
        .publish("hsp/acks/subscriber", Bytes::from_static(b"{}"), DeliveryQos::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), "hsp/acks/subscriber");
}

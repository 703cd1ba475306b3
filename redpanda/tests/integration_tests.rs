//! Integration tests for [`RedpandaBroker`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Topic create/delete through the admin client
//! - Publish/consume round trip with `from_beginning`
//! - Request/reply between two messaging clients
//! - Liveness of a connected client
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//! - Can be flaky due to Kafka's distributed nature and timing
//!
//! To run explicitly:
//! ```bash
//! cargo test -p busline-redpanda --test integration_tests -- --ignored
//! ```
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use busline_core::broker::{Broker, BrokerError, DeliveryOptions};
use busline_core::config::{MessagingConfig, OffsetReset};
use busline_core::envelope::EnvelopeBase;
use busline_core::error::MessagingError;
use busline_core::registry::{Delivery, HandlerError, RegistryBuilder, SubscribeOptions, handler_fn};
use busline_redpanda::RedpandaBroker;
use busline_runtime::MessagingClient;
use busline_testing::init_test_tracing;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return the container with its bootstrap address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    init_test_tracing();

    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;

    (kafka, brokers)
}

/// Helper to wait for Kafka to be ready
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(broker) = RedpandaBroker::new(brokers) {
            if broker.connect_admin().await.is_ok() {
                // Give Kafka time to fully initialize
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn config(brokers: &str, group_id: &str) -> MessagingConfig {
    MessagingConfig {
        brokers: brokers.to_string(),
        group_id: group_id.to_string(),
        request_timeout: Duration::from_secs(30),
        auto_offset_reset: OffsetReset::Earliest,
        ..MessagingConfig::default()
    }
}

#[tokio::test]
#[ignore]
async fn test_topic_create_and_delete() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = RedpandaBroker::new(&brokers).expect("Failed to create broker");
    broker.connect_admin().await.expect("Failed to connect admin");

    broker
        .create_topic("admin-topic")
        .await
        .expect("Failed to create topic");
    // Creating an existing topic is not an error
    broker
        .create_topic("admin-topic")
        .await
        .expect("Second create should succeed");

    broker
        .delete_topic("admin-topic")
        .await
        .expect("Failed to delete topic");

    // Deletion propagates asynchronously
    let mut outcome = Ok(());
    for _ in 0..30 {
        outcome = broker.delete_topic("admin-topic").await;
        if outcome.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(matches!(outcome, Err(BrokerError::TopicNotFound(_))));

    broker.disconnect_admin().await.expect("Failed to disconnect admin");
}

#[tokio::test]
#[ignore]
async fn test_publish_and_consume_from_beginning() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = RedpandaBroker::builder()
        .brokers(&brokers)
        .auto_offset_reset(OffsetReset::Latest)
        .build()
        .expect("Failed to create broker");
    broker.create_topic("orders").await.expect("Failed to create topic");

    // Published before the consumer exists; only from_beginning sees it
    let producer = broker.producer().expect("Failed to create producer");
    producer.connect().await.expect("Failed to connect producer");
    producer
        .publish("orders", br#"{"order":1}"#, &DeliveryOptions::default().key("order-1"))
        .await
        .expect("Failed to publish");
    producer.disconnect().await.expect("Failed to flush producer");

    let consumer = broker.consumer("orders-group").expect("Failed to create consumer");
    consumer.connect().await.expect("Failed to connect consumer");
    consumer
        .subscribe("orders", true)
        .await
        .expect("Failed to subscribe");
    let mut stream = consumer.run().await.expect("Failed to run consumer");

    let message = tokio::time::timeout(Duration::from_secs(20), stream.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("Failed to receive message");

    assert_eq!(message.topic, "orders");
    assert_eq!(message.key.as_deref(), Some(b"order-1".as_slice()));
    assert_eq!(message.payload.as_deref(), Some(br#"{"order":1}"#.as_slice()));

    consumer.disconnect().await.expect("Failed to disconnect consumer");
}

#[tokio::test]
#[ignore]
async fn test_request_reply_between_clients() {
    let (_kafka, brokers) = start_kafka().await;

    let mut registry = RegistryBuilder::new();
    registry
        .register(
            "math.add",
            handler_fn(|delivery: Delivery<MessagingClient>| async move {
                let data = delivery.envelope.data().cloned().unwrap_or(Value::Null);
                let a = data["a"].as_i64().unwrap_or_default();
                let b = data["b"].as_i64().unwrap_or_default();
                Ok(json!(a + b))
            }),
            SubscribeOptions::default().from_beginning(true).expects_reply(true),
        )
        .expect("Failed to register handler")
        .register(
            "math.fail",
            handler_fn(|_delivery: Delivery<MessagingClient>| async move {
                Err::<Value, _>(HandlerError::new("Unsupported", "no such operation"))
            }),
            SubscribeOptions::default().from_beginning(true).expects_reply(true),
        )
        .expect("Failed to register handler");

    let service_broker = Arc::new(RedpandaBroker::new(&brokers).expect("Failed to create broker"));
    service_broker
        .create_topic("math.add")
        .await
        .expect("Failed to create topic");
    service_broker
        .create_topic("math.fail")
        .await
        .expect("Failed to create topic");

    let service = MessagingClient::builder(service_broker)
        .config(config(&brokers, "math-service"))
        .registry(registry.freeze())
        .build();
    service.connect().await.expect("Failed to connect service");

    let caller_broker = Arc::new(RedpandaBroker::new(&brokers).expect("Failed to create broker"));
    let caller = MessagingClient::builder(caller_broker)
        .config(config(&brokers, "math-caller"))
        .build();

    let sum: i64 = caller
        .request("math.add", json!({"a": 2, "b": 3}))
        .await
        .expect("Request failed");
    assert_eq!(sum, 5);

    let failed = caller
        .request_reply(
            EnvelopeBase::new("math.fail").with_data(json!({})),
            &DeliveryOptions::default(),
            Duration::from_secs(30),
        )
        .await;
    assert!(matches!(
        failed,
        Err(MessagingError::Remote(ref error)) if error.name == "Unsupported"
    ));

    service.shutdown().await.expect("Failed to shut down service");
}

#[tokio::test]
#[ignore]
async fn test_connected_client_becomes_healthy() {
    let (_kafka, brokers) = start_kafka().await;

    let mut registry = RegistryBuilder::new();
    registry
        .register(
            "heartbeat-topic",
            handler_fn(|_delivery: Delivery<MessagingClient>| async move { Ok(Value::Null) }),
            SubscribeOptions::default(),
        )
        .expect("Failed to register handler");

    let broker = Arc::new(
        RedpandaBroker::builder()
            .brokers(&brokers)
            .statistics_interval(Duration::from_millis(200))
            .build()
            .expect("Failed to create broker"),
    );
    broker
        .create_topic("heartbeat-topic")
        .await
        .expect("Failed to create topic");

    let client = MessagingClient::builder(broker)
        .config(config(&brokers, "heartbeat-group"))
        .registry(registry.freeze())
        .build();
    client.connect().await.expect("Failed to connect");

    // Wait for the member to join and report a steady heartbeat
    let mut healthy = false;
    for _ in 0..50 {
        if client.liveness().has_fresh_heartbeat() && client.is_healthy().await {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(healthy, "Client never reported a heartbeat");

    client.shutdown().await.expect("Failed to shut down");
}

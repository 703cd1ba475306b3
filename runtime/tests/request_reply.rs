//! Integration tests for publish, dispatch and request/reply over the
//! in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use busline_core::broker::{Broker, DeliveryOptions, InboundMessage};
use busline_core::envelope::{EnvelopeBase, EnvelopeOptions, decode, encode};
use busline_core::error::{CleanupFailure, MessagingError};
use busline_core::registry::{
    Delivery, Handler, HandlerError, RegistryBuilder, SubscribeOptions, handler_fn,
};
use busline_core::{Envelope, SerializedError};
use busline_runtime::{Dispatched, MessagingClient};
use busline_testing::{Fault, InMemoryBroker, init_test_tracing, test_clock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Test Fixtures
// ============================================================================

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

fn operands(delivery: &Delivery<MessagingClient>) -> Result<Operands, HandlerError> {
    serde_json::from_value(delivery.envelope.data().cloned().unwrap_or_default())
        .map_err(|e| HandlerError::new("InvalidInput", e.to_string()))
}

fn add() -> Handler<MessagingClient> {
    handler_fn(|delivery: Delivery<MessagingClient>| async move {
        let Operands { a, b } = operands(&delivery)?;
        Ok(json!(a + b))
    })
}

fn divide() -> Handler<MessagingClient> {
    handler_fn(|delivery: Delivery<MessagingClient>| async move {
        let Operands { a, b } = operands(&delivery)?;
        if b == 0 {
            return Err(HandlerError::new("DivisionByZero", "cannot divide by zero")
                .with_code("MATH_DIV_ZERO"));
        }
        Ok(json!(a / b))
    })
}

fn math_client(broker: &InMemoryBroker) -> MessagingClient {
    let mut registry = RegistryBuilder::new();
    registry
        .register("math.add", add(), SubscribeOptions::default().expects_reply(true))
        .unwrap()
        .register("math.divide", divide(), SubscribeOptions::default().expects_reply(true))
        .unwrap();

    MessagingClient::builder(Arc::new(broker.clone()))
        .registry(registry.freeze())
        .build()
}

fn reply_topics(broker: &InMemoryBroker) -> Vec<String> {
    broker
        .topics()
        .into_iter()
        .filter(|topic| topic.contains(".response."))
        .collect()
}

fn inbound(topic: &str, envelope: &Envelope) -> InboundMessage {
    InboundMessage::new(topic, 0, 0, encode(envelope).unwrap())
}

// ============================================================================
// Request/Reply
// ============================================================================

#[tokio::test(start_paused = true)]
async fn request_without_replier_times_out_and_removes_reply_topic() {
    init_test_tracing();
    let broker = InMemoryBroker::new();
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();

    let result = client
        .request_reply(
            EnvelopeBase::<Value>::new("ping"),
            &DeliveryOptions::default(),
            Duration::from_millis(100),
        )
        .await;

    match result {
        Err(MessagingError::Timeout { topic }) => assert_eq!(topic, "ping"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(reply_topics(&broker).is_empty());
    assert_eq!(broker.connected_consumers(), 0);
    assert_eq!(broker.open_producers(), 0);

    // The request itself was published.
    let request = broker.published_to("ping")[0].envelope();
    assert!(request.request_id().is_some());
    assert!(!broker.topic_exists(request.response_to()));
}

#[tokio::test(start_paused = true)]
async fn timeout_during_publish_still_disconnects_producer() {
    let broker = InMemoryBroker::new();
    broker.set_publish_delay(Duration::from_secs(1));
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();

    let result = client
        .request_reply(
            EnvelopeBase::<Value>::new("ping"),
            &DeliveryOptions::default(),
            Duration::from_millis(100),
        )
        .await;
    assert!(matches!(result, Err(MessagingError::Timeout { .. })));
    assert!(reply_topics(&broker).is_empty());

    // The interrupted publish completes on its own and releases the producer.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.producers_created(), 1);
    assert_eq!(broker.open_producers(), 0);
    assert_eq!(broker.published_to("ping").len(), 1);
}

#[tokio::test]
async fn add_replies_with_sum_on_response_topic() {
    init_test_tracing();
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    client.connect().await.unwrap();

    let reply = client
        .request_reply(
            EnvelopeBase::new("math.add").with_data(json!({ "a": 1, "b": 2 })),
            &DeliveryOptions::default(),
            REPLY_TIMEOUT,
        )
        .await
        .unwrap();

    let request = broker.published_to("math.add")[0].envelope();
    assert_eq!(reply.topic(), request.response_to());
    assert_eq!(reply.data(), Some(&json!(3)));
    assert!(reply.error().is_none());
    assert_eq!(broker.published_to(request.response_to()).len(), 1);
    assert!(reply_topics(&broker).is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_handler_replies_with_error_and_escalates() {
    init_test_tracing();
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    let mut failures = client.take_failures().unwrap();
    client.connect().await.unwrap();

    let result = client
        .request_reply(
            EnvelopeBase::new("math.divide").with_data(json!({ "a": 1, "b": 0 })),
            &DeliveryOptions::default(),
            REPLY_TIMEOUT,
        )
        .await;

    let remote = match result {
        Err(MessagingError::Remote(error)) => error,
        other => panic!("expected remote error, got {other:?}"),
    };
    assert_eq!(remote.name, "DivisionByZero");
    assert_eq!(remote.code.as_deref(), Some("MATH_DIV_ZERO"));

    // On the wire: no data, error populated.
    let request = broker.published_to("math.divide")[0].envelope();
    let reply = broker.published_to(request.response_to())[0].envelope();
    assert!(reply.data().is_none());
    assert_eq!(reply.error().map(|e| e.name.as_str()), Some("DivisionByZero"));

    // And the failure still left the dispatch loop.
    let failure = tokio::time::timeout(REPLY_TIMEOUT, failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.topic, "math.divide");
    match failure.error {
        MessagingError::HandlerFailed { topic, error } => {
            assert_eq!(topic, "math.divide");
            assert_eq!(error.name, "DivisionByZero");
        },
        other => panic!("expected handler failure, got {other:?}"),
    }

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_get_their_own_replies() {
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    client.connect().await.unwrap();

    let options = DeliveryOptions::default();
    let (first, second) = tokio::join!(
        client.request_reply(
            EnvelopeBase::new("math.add").with_data(json!({ "a": 1, "b": 2 })),
            &options,
            REPLY_TIMEOUT,
        ),
        client.request_reply(
            EnvelopeBase::new("math.add").with_data(json!({ "a": 10, "b": 20 })),
            &options,
            REPLY_TIMEOUT,
        ),
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.data(), Some(&json!(3)));
    assert_eq!(second.data(), Some(&json!(30)));
    assert_ne!(first.topic(), second.topic());

    let requests = broker.published_to("math.add");
    assert_eq!(requests.len(), 2);
    assert_ne!(
        requests[0].envelope().response_to(),
        requests[1].envelope().response_to()
    );

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn typed_request_round_trips_payloads() {
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    client.connect().await.unwrap();

    let sum: i64 = client
        .request("math.add", Operands { a: 40, b: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 42);

    let mismatch = client
        .request::<_, String>("math.add", Operands { a: 1, b: 1 })
        .await;
    assert!(matches!(mismatch, Err(MessagingError::Decode(_))));

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_topic_deletion_is_reported_with_primary_timeout() {
    let broker = InMemoryBroker::new();
    broker.inject(Fault::DeleteTopic);
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();

    let err = client
        .request_reply(
            EnvelopeBase::<Value>::new("ping"),
            &DeliveryOptions::default(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    match &err {
        MessagingError::Cleanup { topic, failures, .. } => {
            assert_eq!(topic, "ping");
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0], CleanupFailure::DeleteTopic { .. }));
        },
        other => panic!("expected cleanup error, got {other:?}"),
    }
    // The consumer was still released.
    assert_eq!(broker.connected_consumers(), 0);
}

#[tokio::test]
async fn reply_survives_failed_consumer_disconnect() {
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    client.connect().await.unwrap();
    broker.inject(Fault::DisconnectConsumer);

    let err = client
        .request_reply(
            EnvelopeBase::new("math.add").with_data(json!({ "a": 2, "b": 2 })),
            &DeliveryOptions::default(),
            REPLY_TIMEOUT,
        )
        .await
        .unwrap_err();

    match &err {
        MessagingError::Cleanup { failures, .. } => {
            assert!(matches!(failures[0], CleanupFailure::Disconnect { .. }));
        },
        other => panic!("expected cleanup error, got {other:?}"),
    }
    // Topic deletion still ran.
    assert!(reply_topics(&broker).is_empty());

    let reply = err.into_primary().unwrap();
    assert_eq!(reply.data(), Some(&json!(4)));
}

#[tokio::test]
async fn invalid_request_creates_nothing() {
    let broker = InMemoryBroker::new();
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();

    let result = client
        .request_reply(
            EnvelopeBase::<Value>::new(""),
            &DeliveryOptions::default(),
            REPLY_TIMEOUT,
        )
        .await;

    assert!(matches!(result, Err(MessagingError::Validation(_))));
    assert!(broker.topics().is_empty());
    assert_eq!(broker.producers_created(), 0);
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn send_publishes_encoded_envelope_with_options() {
    let broker = InMemoryBroker::new();
    let client = MessagingClient::builder(Arc::new(broker.clone()))
        .clock(Arc::new(test_clock()))
        .build();

    let envelope = client
        .create_envelope(
            EnvelopeBase::new("orders.placed").with_data(json!({ "sku": "A-1" })),
            EnvelopeOptions::default(),
        )
        .unwrap();
    assert_eq!(envelope.date_time(), "2025-01-01T00:00:00.000Z");

    let options = DeliveryOptions::default().key("order-1");
    tokio_test::assert_ok!(client.send(&envelope, &options).await);

    let published = broker.published_to("orders.placed");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].options.key.as_deref(), Some("order-1"));
    assert_eq!(published[0].envelope(), envelope);
    assert_eq!(broker.open_producers(), 0);
}

#[tokio::test]
async fn send_reports_publish_failure_and_still_closes_producer() {
    let broker = InMemoryBroker::new();
    broker.inject(Fault::Publish);
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();
    let envelope = client
        .create_envelope(EnvelopeBase::<Value>::new("orders.placed"), EnvelopeOptions::default())
        .unwrap();

    let result = client.send(&envelope, &DeliveryOptions::default()).await;
    assert!(matches!(result, Err(MessagingError::Broker(_))));
    assert_eq!(broker.open_producers(), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn send_reports_producer_teardown_failure_after_publish() {
    let broker = InMemoryBroker::new();
    broker.inject(Fault::DisconnectProducer);
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();
    let envelope = client
        .create_envelope(EnvelopeBase::<Value>::new("orders.placed"), EnvelopeOptions::default())
        .unwrap();

    let err = client
        .send(&envelope, &DeliveryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        MessagingError::Cleanup { failures, .. } if matches!(failures[..], [CleanupFailure::Producer { .. }])
    ));
    assert_eq!(err.into_primary().unwrap().trace_id(), envelope.trace_id());
    assert_eq!(broker.published_to("orders.placed").len(), 1);
}

#[tokio::test]
async fn send_rejects_malformed_envelope_before_opening_producer() {
    let broker = InMemoryBroker::new();
    let client = MessagingClient::builder(Arc::new(broker.clone())).build();
    let malformed: Envelope = decode(
        br#"{"topic":"t","data":1,"error":{"name":"E","message":"m"},"traceId":"x",
            "requestId":null,"responseTo":"t.response.x","timestamp":0,
            "dateTime":"1970-01-01T00:00:00.000Z"}"#,
    )
    .unwrap();

    let result = client.send(&malformed, &DeliveryOptions::default()).await;
    assert!(matches!(result, Err(MessagingError::Validation(_))));
    assert_eq!(broker.producers_created(), 0);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn dispatch_publishes_exactly_one_reply() {
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    let request = client
        .create_envelope(
            EnvelopeBase::new("math.add").with_data(json!({ "a": 5, "b": 6 })),
            EnvelopeOptions::client_request(),
        )
        .unwrap();

    let outcome = client.dispatch(inbound("math.add", &request)).await.unwrap();
    assert_eq!(outcome, Dispatched::Handled { replied: true });

    let replies = broker.published_to(request.response_to());
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].envelope().data(), Some(&json!(11)));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn dispatch_without_reply_escalates_failure_and_publishes_nothing() {
    let broker = InMemoryBroker::new();
    let mut registry = RegistryBuilder::new();
    registry
        .register("math.divide", divide(), SubscribeOptions::default())
        .unwrap();
    let client = MessagingClient::builder(Arc::new(broker.clone()))
        .registry(registry.freeze())
        .build();

    let request = client
        .create_envelope(
            EnvelopeBase::new("math.divide").with_data(json!({ "a": 1, "b": 0 })),
            EnvelopeOptions::default(),
        )
        .unwrap();

    let err = client
        .dispatch(inbound("math.divide", &request))
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::HandlerFailed { ref topic, .. } if topic == "math.divide"));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn dispatch_drops_unknown_topics_and_rejects_garbage() {
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    let stray = client
        .create_envelope(EnvelopeBase::<Value>::new("billing.charge"), EnvelopeOptions::default())
        .unwrap();

    assert_eq!(
        client.dispatch(inbound("billing.charge", &stray)).await.unwrap(),
        Dispatched::Unrouted
    );
    assert!(matches!(
        client
            .dispatch(InboundMessage::new("math.add", 0, 1, b"{oops".to_vec()))
            .await,
        Err(MessagingError::Decode(_))
    ));

    let mut tombstone = InboundMessage::new("math.add", 0, 2, Vec::new());
    tombstone.payload = None;
    assert!(matches!(
        client.dispatch(tombstone).await,
        Err(MessagingError::Decode(_))
    ));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn panicking_handler_becomes_failure_reply() {
    let broker = InMemoryBroker::new();
    let mut registry = RegistryBuilder::new();
    registry
        .register(
            "explode",
            handler_fn(|_delivery: Delivery<MessagingClient>| async move {
                let values: Vec<Value> = Vec::new();
                Ok(values[1].clone())
            }),
            SubscribeOptions::default().expects_reply(true),
        )
        .unwrap();
    let client = MessagingClient::builder(Arc::new(broker.clone()))
        .registry(registry.freeze())
        .build();
    let request = client
        .create_envelope(EnvelopeBase::<Value>::new("explode"), EnvelopeOptions::client_request())
        .unwrap();

    let err = client.dispatch(inbound("explode", &request)).await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::HandlerFailed { ref error, .. } if error.name == "HandlerPanicked"
    ));
    let reply = broker.published_to(request.response_to())[0].envelope();
    assert_eq!(reply.error().map(|e| e.name.as_str()), Some("HandlerPanicked"));
}

#[tokio::test]
async fn dispatch_loop_survives_undecodable_messages() {
    init_test_tracing();
    let broker = InMemoryBroker::new();
    let client = math_client(&broker);
    let mut failures = client.take_failures().unwrap();
    client.connect().await.unwrap();

    let producer = broker.producer().unwrap();
    producer.connect().await.unwrap();
    producer
        .publish("math.add", b"not an envelope", &DeliveryOptions::default())
        .await
        .unwrap();
    producer.disconnect().await.unwrap();

    let sum: i64 = client.request("math.add", Operands { a: 1, b: 2 }).await.unwrap();
    assert_eq!(sum, 3);
    // Decode errors are logged, not escalated.
    assert!(failures.try_recv().is_err());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn handlers_can_publish_through_the_delivered_client() {
    let broker = InMemoryBroker::new();
    let mut registry = RegistryBuilder::new();
    registry
        .register(
            "orders.place",
            handler_fn(|delivery: Delivery<MessagingClient>| async move {
                let event = delivery
                    .client
                    .create_envelope(
                        EnvelopeBase::new("orders.placed").with_data(delivery.envelope.data().cloned().unwrap_or_default()),
                        EnvelopeOptions::default(),
                    )
                    .map_err(HandlerError::from)?;
                delivery
                    .client
                    .send(&event, &DeliveryOptions::default())
                    .await
                    .map_err(HandlerError::from)?;
                Ok(json!({ "accepted": true }))
            }),
            SubscribeOptions::default().expects_reply(true),
        )
        .unwrap();
    let client = MessagingClient::builder(Arc::new(broker.clone()))
        .registry(registry.freeze())
        .build();
    client.connect().await.unwrap();

    let reply: Value = client.request("orders.place", json!({ "sku": "A-1" })).await.unwrap();
    assert_eq!(reply, json!({ "accepted": true }));

    let placed = broker.published_to("orders.placed");
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].envelope().data(), Some(&json!({ "sku": "A-1" })));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn from_beginning_subscriptions_see_earlier_messages() {
    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();

    let producer = broker.producer().unwrap();
    producer.connect().await.unwrap();
    for topic in ["audit.login", "metrics.tick"] {
        let envelope = busline_core::envelope::create_envelope(
            EnvelopeBase::new(topic).with_data(json!("before")),
            EnvelopeOptions::default(),
        )
        .unwrap();
        producer
            .publish(topic, &encode(&envelope).unwrap(), &DeliveryOptions::default())
            .await
            .unwrap();
    }

    let recorder = |tx: mpsc::UnboundedSender<(String, Value)>| {
        handler_fn(move |delivery: Delivery<MessagingClient>| {
            let tx = tx.clone();
            async move {
                let topic = delivery.envelope.topic().to_string();
                let data = delivery.envelope.into_data().unwrap_or_default();
                tx.send((topic, data)).unwrap();
                Ok(Value::Null)
            }
        })
    };

    let mut registry = RegistryBuilder::new();
    registry
        .register("audit.login", recorder(tx.clone()), SubscribeOptions::default().from_beginning(true))
        .unwrap()
        .register("metrics.tick", recorder(tx), SubscribeOptions::default())
        .unwrap();
    let client = MessagingClient::builder(Arc::new(broker.clone()))
        .registry(registry.freeze())
        .build();
    client.connect().await.unwrap();

    let after = busline_core::envelope::create_envelope(
        EnvelopeBase::new("metrics.tick").with_data(json!("after")),
        EnvelopeOptions::default(),
    )
    .unwrap();
    producer
        .publish("metrics.tick", &encode(&after).unwrap(), &DeliveryOptions::default())
        .await
        .unwrap();

    let first = tokio::time::timeout(REPLY_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(REPLY_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, ("audit.login".to_string(), json!("before")));
    assert_eq!(second, ("metrics.tick".to_string(), json!("after")));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn last_registration_for_a_topic_handles_messages() {
    let broker = InMemoryBroker::new();
    let mut registry = RegistryBuilder::new();
    registry
        .register("math.op", add(), SubscribeOptions::default().expects_reply(true))
        .unwrap()
        .register("math.op", divide(), SubscribeOptions::default().expects_reply(true))
        .unwrap();
    let client = MessagingClient::builder(Arc::new(broker.clone()))
        .registry(registry.freeze())
        .build();
    client.connect().await.unwrap();

    let quotient: i64 = client.request("math.op", Operands { a: 8, b: 2 }).await.unwrap();
    assert_eq!(quotient, 4);

    client.shutdown().await.unwrap();
}

#[test]
fn serialized_error_is_what_remote_callers_see() {
    let error: SerializedError = HandlerError::new("DivisionByZero", "cannot divide by zero").into();
    assert_eq!(
        serde_json::to_value(&error).unwrap(),
        json!({ "name": "DivisionByZero", "message": "cannot divide by zero" })
    );
}

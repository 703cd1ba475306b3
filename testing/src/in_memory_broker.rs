//! In-memory broker for fast, deterministic messaging tests.
//!
//! [`InMemoryBroker`] implements the full broker boundary in-process:
//!
//! - Topics are append-only logs with a single partition (partition `0`)
//! - Publishing to a missing topic creates it (like `auto.create.topics.enable`)
//! - Every connected consumer subscribed to a topic receives every message
//!   (group load-balancing is not modelled)
//! - `from_beginning` subscriptions replay the topic's log first
//!
//! Tests drive the environment through [`InMemoryBroker::heartbeat`],
//! [`InMemoryBroker::set_group_state`] and [`InMemoryBroker::inject`], and
//! inspect it with [`InMemoryBroker::published_to`],
//! [`InMemoryBroker::topic_exists`] and friends.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use busline_core::broker::{
    Broker, BrokerConsumer, BrokerError, BrokerFuture, BrokerProducer, DeliveryOptions,
    GroupState, HeartbeatObserver, InboundMessage, MessageStream,
};
use busline_core::envelope::{Envelope, decode};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Broker operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `connect_admin` fails
    ConnectAdmin,
    /// Consumer `connect` fails
    ConnectConsumer,
    /// Consumer `subscribe` fails
    Subscribe,
    /// Consumer `disconnect` fails
    DisconnectConsumer,
    /// Producer `publish` fails
    Publish,
    /// Producer `disconnect` fails
    DisconnectProducer,
    /// `create_topic` fails
    CreateTopic,
    /// `delete_topic` fails (with `AdminFailed`, not `TopicNotFound`)
    DeleteTopic,
    /// `describe_group` fails
    DescribeGroup,
}

/// A message recorded by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Options the message was published with
    pub options: DeliveryOptions,
}

impl PublishedMessage {
    /// Decode the payload as an envelope.
    ///
    /// # Panics
    ///
    /// Panics if the payload is not a valid envelope.
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        decode(&self.payload).unwrap()
    }
}

#[derive(Default)]
struct BrokerState {
    admin_connected: bool,
    topics: HashMap<String, Vec<Vec<u8>>>,
    consumers: Vec<Arc<ConsumerShared>>,
    published: Vec<PublishedMessage>,
    group_states: HashMap<String, GroupState>,
    faults: HashSet<Fault>,
    publish_delay: Duration,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    describe_calls: AtomicUsize,
    open_producers: AtomicUsize,
    producers_created: AtomicUsize,
    next_consumer_id: AtomicU64,
}

impl Shared {
    fn fault(&self, fault: Fault) -> bool {
        self.state.lock().unwrap().faults.contains(&fault)
    }
}

/// In-memory implementation of the broker boundary.
///
/// Cloning is cheap; clones share the same topics and consumers.
///
/// # Example
///
/// ```
/// use busline_core::broker::{Broker, DeliveryOptions};
/// use busline_testing::InMemoryBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.create_topic("orders").await?;
///
/// let producer = broker.producer()?;
/// producer.connect().await?;
/// producer.publish("orders", b"{}", &DeliveryOptions::default()).await?;
/// producer.disconnect().await?;
///
/// assert_eq!(broker.published_to("orders").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create an empty broker. Group state defaults to `Stable`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an operation fail until [`clear`](Self::clear) is called.
    pub fn inject(&self, fault: Fault) {
        self.shared.state.lock().unwrap().faults.insert(fault);
    }

    /// Stop failing an operation.
    pub fn clear(&self, fault: Fault) {
        self.shared.state.lock().unwrap().faults.remove(&fault);
    }

    /// Hold every publish for `delay` before the message is delivered.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.shared.state.lock().unwrap().publish_delay = delay;
    }

    /// Set the state reported by `describe_group` for `group_id`.
    pub fn set_group_state(&self, group_id: &str, state: GroupState) {
        self.shared
            .state
            .lock()
            .unwrap()
            .group_states
            .insert(group_id.to_string(), state);
    }

    /// Emit a heartbeat at `at` from every connected consumer in `group_id`.
    pub fn heartbeat(&self, group_id: &str, at: DateTime<Utc>) {
        let observers: Vec<HeartbeatObserver> = {
            let state = self.shared.state.lock().unwrap();
            state
                .consumers
                .iter()
                .filter(|c| c.group_id == group_id)
                .filter_map(|c| c.state.lock().unwrap().observer.clone())
                .collect()
        };
        for observer in observers {
            observer(at);
        }
    }

    /// Create a topic with no messages. Unlike [`Broker::create_topic`] this
    /// ignores injected faults.
    pub fn seed_topic(&self, name: &str) {
        self.shared
            .state
            .lock()
            .unwrap()
            .topics
            .entry(name.to_string())
            .or_default();
    }

    /// Whether `name` currently exists.
    #[must_use]
    pub fn topic_exists(&self, name: &str) -> bool {
        self.shared.state.lock().unwrap().topics.contains_key(name)
    }

    /// All existing topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .shared
            .state
            .lock()
            .unwrap()
            .topics
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Every message ever published, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().unwrap().published.clone()
    }

    /// Every message ever published to `topic`, in order (survives topic deletion).
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.shared
            .state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Whether the admin connection is open.
    #[must_use]
    pub fn admin_connected(&self) -> bool {
        self.shared.state.lock().unwrap().admin_connected
    }

    /// Number of connected consumers.
    #[must_use]
    pub fn connected_consumers(&self) -> usize {
        self.shared.state.lock().unwrap().consumers.len()
    }

    /// Group ids of connected consumers.
    #[must_use]
    pub fn consumer_groups(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .map(|c| c.group_id.clone())
            .collect()
    }

    /// Number of producers connected and not yet disconnected.
    #[must_use]
    pub fn open_producers(&self) -> usize {
        self.shared.open_producers.load(Ordering::SeqCst)
    }

    /// Number of producers ever created.
    #[must_use]
    pub fn producers_created(&self) -> usize {
        self.shared.producers_created.load(Ordering::SeqCst)
    }

    /// Number of `describe_group` calls so far.
    #[must_use]
    pub fn describe_group_calls(&self) -> usize {
        self.shared.describe_calls.load(Ordering::SeqCst)
    }

    fn deliver(&self, topic: &str, payload: &[u8], options: &DeliveryOptions) {
        let mut state = self.shared.state.lock().unwrap();
        let log = state.topics.entry(topic.to_string()).or_default();
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
        log.push(payload.to_vec());

        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            options: options.clone(),
        });

        for consumer in &state.consumers {
            let consumer_state = consumer.state.lock().unwrap();
            if consumer_state.subscriptions.contains(topic) {
                if let Some(tx) = &consumer_state.tx {
                    let mut message = InboundMessage::new(topic, 0, offset, payload.to_vec());
                    message.key = options.key.as_ref().map(|k| k.as_bytes().to_vec());
                    let _ = tx.send(message);
                }
            }
        }
    }
}

impl Broker for InMemoryBroker {
    fn connect_admin(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::ConnectAdmin) {
                return Err(BrokerError::ConnectionFailed("admin connection refused".to_string()));
            }
            state.admin_connected = true;
            Ok(())
        })
    }

    fn disconnect_admin(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.shared.state.lock().unwrap().admin_connected = false;
            Ok(())
        })
    }

    fn create_topic<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::CreateTopic) {
                return Err(BrokerError::AdminFailed(format!("cannot create topic '{name}'")));
            }
            state.topics.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    fn delete_topic<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::DeleteTopic) {
                return Err(BrokerError::AdminFailed(format!("cannot delete topic '{name}'")));
            }
            state
                .topics
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
        })
    }

    fn consumer(&self, group_id: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            shared: Arc::new(ConsumerShared {
                id,
                group_id: group_id.to_string(),
                state: Mutex::new(ConsumerState {
                    subscriptions: HashSet::new(),
                    tx: Some(tx),
                    rx: Some(rx),
                    observer: None,
                }),
            }),
        }))
    }

    fn producer(&self) -> Result<Box<dyn BrokerProducer>, BrokerError> {
        self.shared.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryProducer {
            broker: self.clone(),
            connected: AtomicBool::new(false),
        }))
    }
}

struct ConsumerShared {
    id: u64,
    group_id: String,
    state: Mutex<ConsumerState>,
}

struct ConsumerState {
    subscriptions: HashSet<String>,
    tx: Option<mpsc::UnboundedSender<InboundMessage>>,
    rx: Option<mpsc::UnboundedReceiver<InboundMessage>>,
    observer: Option<HeartbeatObserver>,
}

struct InMemoryConsumer {
    broker: InMemoryBroker,
    shared: Arc<ConsumerShared>,
}

impl InMemoryConsumer {
    fn is_connected(state: &BrokerState, id: u64) -> bool {
        state.consumers.iter().any(|c| c.id == id)
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn connect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.broker.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::ConnectConsumer) {
                return Err(BrokerError::ConnectionFailed(format!(
                    "consumer '{}' connection refused",
                    self.shared.group_id
                )));
            }
            if !Self::is_connected(&state, self.shared.id) {
                state.consumers.push(Arc::clone(&self.shared));
            }
            Ok(())
        })
    }

    fn on_heartbeat(&self, observer: HeartbeatObserver) {
        self.shared.state.lock().unwrap().observer = Some(observer);
    }

    fn subscribe<'a>(&'a self, topic: &'a str, from_beginning: bool) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let state = self.broker.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::Subscribe) {
                return Err(BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "subscription rejected".to_string(),
                });
            }
            if !Self::is_connected(&state, self.shared.id) {
                return Err(BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "consumer is not connected".to_string(),
                });
            }

            let mut consumer = self.shared.state.lock().unwrap();
            if !consumer.subscriptions.insert(topic.to_string()) {
                return Ok(());
            }
            if from_beginning {
                if let (Some(log), Some(tx)) = (state.topics.get(topic), &consumer.tx) {
                    for (offset, payload) in log.iter().enumerate() {
                        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
                        let _ = tx.send(InboundMessage::new(topic, 0, offset, payload.clone()));
                    }
                }
            }
            Ok(())
        })
    }

    fn run(&self) -> BrokerFuture<'_, MessageStream> {
        Box::pin(async move {
            let rx = self.shared.state.lock().unwrap().rx.take().ok_or_else(|| {
                BrokerError::Transport(format!(
                    "consumer '{}' is already running",
                    self.shared.group_id
                ))
            })?;

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(message) = rx.recv().await {
                    yield Ok(message);
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn describe_group(&self) -> BrokerFuture<'_, GroupState> {
        Box::pin(async move {
            self.broker.shared.describe_calls.fetch_add(1, Ordering::SeqCst);
            let state = self.broker.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::DescribeGroup) {
                return Err(BrokerError::ConsumerGroup(
                    "group coordinator not available".to_string(),
                ));
            }
            Ok(state
                .group_states
                .get(&self.shared.group_id)
                .cloned()
                .unwrap_or(GroupState::Stable))
        })
    }

    fn disconnect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.broker.shared.state.lock().unwrap();
            if state.faults.contains(&Fault::DisconnectConsumer) {
                return Err(BrokerError::ConnectionFailed(format!(
                    "consumer '{}' failed to leave group",
                    self.shared.group_id
                )));
            }
            state.consumers.retain(|c| c.id != self.shared.id);
            // Dropping the sender ends the message stream.
            self.shared.state.lock().unwrap().tx = None;
            Ok(())
        })
    }
}

struct InMemoryProducer {
    broker: InMemoryBroker,
    connected: AtomicBool,
}

impl BrokerProducer for InMemoryProducer {
    fn connect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected.swap(true, Ordering::SeqCst) {
                self.broker.shared.open_producers.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
        options: &'a DeliveryOptions,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(BrokerError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "producer is not connected".to_string(),
                });
            }
            let delay = self.broker.shared.state.lock().unwrap().publish_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.broker.shared.fault(Fault::Publish) {
                return Err(BrokerError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "broker rejected message".to_string(),
                });
            }
            self.broker.deliver(topic, payload, options);
            Ok(())
        })
    }

    fn disconnect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.connected.swap(false, Ordering::SeqCst) {
                self.broker.shared.open_producers.fetch_sub(1, Ordering::SeqCst);
            }
            if self.broker.shared.fault(Fault::DisconnectProducer) {
                return Err(BrokerError::ConnectionFailed(
                    "producer flush failed".to_string(),
                ));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn from_beginning_replays_existing_messages() {
        let broker = InMemoryBroker::new();
        let producer = broker.producer().unwrap();
        producer.connect().await.unwrap();
        producer.publish("audit", b"one", &DeliveryOptions::default()).await.unwrap();

        let replaying = broker.consumer("replaying").unwrap();
        replaying.connect().await.unwrap();
        replaying.subscribe("audit", true).await.unwrap();

        let tailing = broker.consumer("tailing").unwrap();
        tailing.connect().await.unwrap();
        tailing.subscribe("audit", false).await.unwrap();

        producer.publish("audit", b"two", &DeliveryOptions::default()).await.unwrap();

        let mut replayed = replaying.run().await.unwrap();
        assert_eq!(replayed.next().await.unwrap().unwrap().payload.unwrap(), b"one");
        let second = replayed.next().await.unwrap().unwrap();
        assert_eq!(second.payload.unwrap(), b"two");
        assert_eq!(second.offset, 1);

        let mut tailed = tailing.run().await.unwrap();
        assert_eq!(tailed.next().await.unwrap().unwrap().payload.unwrap(), b"two");
    }

    #[tokio::test]
    async fn disconnect_ends_stream() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("g").unwrap();
        consumer.connect().await.unwrap();
        let mut stream = consumer.run().await.unwrap();

        consumer.disconnect().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.connected_consumers(), 0);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("g").unwrap();
        consumer.connect().await.unwrap();
        let _stream = consumer.run().await.unwrap();
        assert!(matches!(consumer.run().await, Err(BrokerError::Transport(_))));
    }

    #[tokio::test]
    async fn delete_missing_topic_reports_not_found() {
        let broker = InMemoryBroker::new();
        assert_eq!(
            broker.delete_topic("ghost").await,
            Err(BrokerError::TopicNotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn heartbeats_reach_group_members_only() {
        let broker = InMemoryBroker::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let member = broker.consumer("workers").unwrap();
        member.connect().await.unwrap();
        let counter = Arc::clone(&seen);
        member.on_heartbeat(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        broker.heartbeat("workers", Utc::now());
        broker.heartbeat("others", Utc::now());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producers_are_counted_until_disconnected() {
        let broker = InMemoryBroker::new();
        let producer = broker.producer().unwrap();
        producer.connect().await.unwrap();
        assert_eq!(broker.open_producers(), 1);
        producer.disconnect().await.unwrap();
        assert_eq!(broker.open_producers(), 0);
        assert_eq!(broker.producers_created(), 1);
    }
}

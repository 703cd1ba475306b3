//! Broker transport boundary.
//!
//! Busline never talks to a broker directly; it goes through the three roles
//! defined here:
//!
//! - [`Broker`]: the administrative channel (topic create/delete) and a
//!   factory for consumers and producers
//! - [`BrokerConsumer`]: a consumer-group member that subscribes to topics,
//!   yields inbound messages and reports heartbeats and group state
//! - [`BrokerProducer`]: a publisher of raw bytes
//!
//! # Implementations
//!
//! - `RedpandaBroker` (`busline-redpanda`) - For production (Kafka-compatible, rdkafka)
//! - `InMemoryBroker` (`busline-testing`) - For testing (in-process, deterministic)
//!
//! # Dyn Compatibility
//!
//! These traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so they can be used as trait objects (`Arc<dyn Broker>`), which
//! is how the messaging client holds its transport.

use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to (or disconnect from) the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Topic does not exist
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Failed to publish to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Administrative operation (topic create/delete) failed
    #[error("Admin operation failed: {0}")]
    AdminFailed(String),

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of inbound messages for a running consumer.
///
/// Errors are yielded in-band so one bad fetch does not end the stream.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, BrokerError>> + Send>>;

/// Callback invoked with the instant of every consumer heartbeat.
pub type HeartbeatObserver = Arc<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// A raw message delivered by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was consumed from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Optional message key
    pub key: Option<Vec<u8>>,
    /// Message value (`None` for tombstones)
    pub payload: Option<Vec<u8>>,
}

impl InboundMessage {
    /// Create a message with a payload and no key.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: Some(payload),
        }
    }
}

/// Per-message publish options (everything except the value).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Partitioning key
    pub key: Option<String>,
    /// Explicit partition (broker picks one when `None`)
    pub partition: Option<i32>,
    /// Message headers
    pub headers: Vec<(String, String)>,
}

impl DeliveryOptions {
    /// Set the partitioning key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pin the message to a partition.
    #[must_use]
    pub const fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Consumer-group state as reported by the group coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupState {
    /// Group is balanced and consuming
    Stable,
    /// A rebalance was triggered; members are (re)joining
    PreparingRebalance,
    /// Members joined; waiting for the leader's assignment
    CompletingRebalance,
    /// No members
    Empty,
    /// Group was removed
    Dead,
    /// Any state string this client does not recognise
    Unknown(String),
}

impl GroupState {
    /// Parse the coordinator's state string.
    #[must_use]
    pub fn parse(state: &str) -> Self {
        match state {
            "Stable" => Self::Stable,
            "PreparingRebalance" => Self::PreparingRebalance,
            // Older brokers report this state as "AwaitingSync"
            "CompletingRebalance" | "AwaitingSync" => Self::CompletingRebalance,
            "Empty" => Self::Empty,
            "Dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether a rebalance is in progress.
    #[must_use]
    pub const fn is_rebalancing(&self) -> bool {
        matches!(self, Self::PreparingRebalance | Self::CompletingRebalance)
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "Stable"),
            Self::PreparingRebalance => write!(f, "PreparingRebalance"),
            Self::CompletingRebalance => write!(f, "CompletingRebalance"),
            Self::Empty => write!(f, "Empty"),
            Self::Dead => write!(f, "Dead"),
            Self::Unknown(state) => write!(f, "{state}"),
        }
    }
}

/// Administrative channel and factory for consumers and producers.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the messaging client shares one
/// broker between its dispatch loop and every concurrent request.
pub trait Broker: Send + Sync {
    /// Open the administrative connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker is unreachable.
    fn connect_admin(&self) -> BrokerFuture<'_, ()>;

    /// Close the administrative connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the connection cannot be closed cleanly.
    fn disconnect_admin(&self) -> BrokerFuture<'_, ()>;

    /// Create a topic. Creating an existing topic is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AdminFailed`] if the broker rejects the request.
    fn create_topic<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Delete a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopicNotFound`] if the topic does not exist, or
    /// [`BrokerError::AdminFailed`] for any other rejection.
    fn delete_topic<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Create a (not yet connected) consumer in the given group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumerGroup`] if the consumer cannot be configured.
    fn consumer(&self, group_id: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    /// Create a (not yet connected) producer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be configured.
    fn producer(&self) -> Result<Box<dyn BrokerProducer>, BrokerError>;
}

/// A consumer-group member.
pub trait BrokerConsumer: Send + Sync {
    /// Join the broker as a consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the consumer cannot connect.
    fn connect(&self) -> BrokerFuture<'_, ()>;

    /// Register the heartbeat observer. Replaces any previous observer.
    fn on_heartbeat(&self, observer: HeartbeatObserver);

    /// Subscribe to a topic.
    ///
    /// `from_beginning` applies when the group has no committed offset for
    /// the topic: read from the earliest offset instead of only new messages.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription is rejected.
    fn subscribe<'a>(&'a self, topic: &'a str, from_beginning: bool) -> BrokerFuture<'a, ()>;

    /// Start consuming and return the message stream.
    ///
    /// Per-partition order is preserved within the stream.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if consumption cannot start (for
    /// example when the consumer is already running).
    fn run(&self) -> BrokerFuture<'_, MessageStream>;

    /// Read the current state of this consumer's group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumerGroup`] if the coordinator cannot be queried.
    fn describe_group(&self) -> BrokerFuture<'_, GroupState>;

    /// Leave the group and release the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the consumer cannot disconnect cleanly.
    fn disconnect(&self) -> BrokerFuture<'_, ()>;
}

/// A publisher of raw bytes.
pub trait BrokerProducer: Send + Sync {
    /// Open the producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot connect.
    fn connect(&self) -> BrokerFuture<'_, ()>;

    /// Publish one message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker does not acknowledge the message.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
        options: &'a DeliveryOptions,
    ) -> BrokerFuture<'a, ()>;

    /// Flush and release the producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if pending messages cannot be flushed.
    fn disconnect(&self) -> BrokerFuture<'_, ()>;
}

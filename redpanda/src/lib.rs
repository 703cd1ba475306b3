//! Redpanda broker implementation for Busline.
//!
//! This crate provides a production [`Broker`] for the Busline messaging
//! client. It uses rdkafka, so it works with Redpanda, Apache Kafka or any
//! other Kafka-compatible cluster.
//!
//! # Roles
//!
//! - [`RedpandaBroker`]: admin client for topic create/delete (reply topics
//!   are created and deleted per request) and factory for the other two
//! - [`RedpandaConsumer`]: consumer-group member with manual offset commits
//!   and heartbeats derived from librdkafka statistics
//! - [`RedpandaProducer`]: `FutureProducer` publisher
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the message reaches the consumer's stream
//! - If the process crashes before commit, messages are redelivered
//! - Ordering is guaranteed within a partition
//!
//! # Example
//!
//! ```no_run
//! use busline_core::config::MessagingConfig;
//! use busline_redpanda::RedpandaBroker;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MessagingConfig::from_env()?;
//! let broker = Arc::new(RedpandaBroker::from_config(&config)?);
//! # Ok(())
//! # }
//! ```

mod consumer;
mod producer;

pub use consumer::RedpandaConsumer;
pub use producer::RedpandaProducer;

use busline_core::broker::{Broker, BrokerConsumer, BrokerError, BrokerFuture, BrokerProducer};
use busline_core::config::{MessagingConfig, OffsetReset};
use consumer::ConsumerSettings;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;
use std::sync::Arc;
use std::time::Duration;

/// Redpanda (Kafka-compatible) broker.
///
/// Holds one admin client for the lifetime of the broker. Consumers and
/// producers are created on demand; the messaging client creates a producer
/// per publish and a consumer per request/reply exchange.
///
/// # Example
///
/// ```no_run
/// use busline_redpanda::RedpandaBroker;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    brokers: String,
    client_id: String,
    admin: Arc<AdminClient<DefaultClientContext>>,
    producer_config: ClientConfig,
    timeout: Duration,
    session_timeout: Duration,
    statistics_interval: Duration,
    auto_offset_reset: OffsetReset,
    buffer_size: usize,
    topic_partitions: i32,
    replication_factor: i32,
}

impl RedpandaBroker {
    /// Create a broker with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the admin client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a broker from messaging configuration.
    ///
    /// Uses `brokers`, `client_id`, `session_timeout` and
    /// `auto_offset_reset`; the client applies `request_timeout` itself.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the admin client cannot be created.
    pub fn from_config(config: &MessagingConfig) -> Result<Self, BrokerError> {
        Self::builder()
            .brokers(&config.brokers)
            .client_id(&config.client_id)
            .session_timeout(config.session_timeout)
            .auto_offset_reset(config.auto_offset_reset)
            .build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// The configured bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new().operation_timeout(Some(self.timeout))
    }
}

/// Builder for [`RedpandaBroker`].
#[derive(Debug, Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    session_timeout: Option<Duration>,
    statistics_interval: Option<Duration>,
    auto_offset_reset: Option<OffsetReset>,
    buffer_size: Option<usize>,
    topic_partitions: Option<i32>,
    replication_factor: Option<i32>,
}

impl RedpandaBrokerBuilder {
    /// Set the bootstrap servers (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the client id reported to the cluster (default: `busline`).
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set producer acknowledgment mode.
    ///
    /// - `"0"`: No acknowledgment (fastest, least durable)
    /// - `"1"`: Leader acknowledgment (default)
    /// - `"all"`: All in-sync replicas (slowest, most durable)
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set compression type (`none`, `gzip`, `snappy`, `lz4`, `zstd`).
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the timeout for publishes, admin operations and group queries (default: 5s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer session timeout (default: 6s).
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how often consumers emit statistics, which drive heartbeats (default: 1s).
    #[must_use]
    pub const fn statistics_interval(mut self, interval: Duration) -> Self {
        self.statistics_interval = Some(interval);
        self
    }

    /// Set where consumers start for topics not subscribed `from_beginning`
    /// (default: latest).
    #[must_use]
    pub const fn auto_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.auto_offset_reset = Some(policy);
        self
    }

    /// Set the consumer's message buffer (default: 1000).
    ///
    /// Zero is raised to one.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set the partition count of topics created through the broker (default: 1).
    #[must_use]
    pub const fn topic_partitions(mut self, partitions: i32) -> Self {
        self.topic_partitions = Some(partitions);
        self
    }

    /// Set the replication factor of topics created through the broker (default: 1).
    #[must_use]
    pub const fn replication_factor(mut self, factor: i32) -> Self {
        self.replication_factor = Some(factor);
        self
    }

    /// Build the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create the admin client
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let client_id = self.client_id.unwrap_or_else(|| "busline".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.unwrap_or_else(|| "1".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create admin client: {e}"))
            })?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression);

        let broker = RedpandaBroker {
            admin: Arc::new(admin),
            producer_config,
            timeout,
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            statistics_interval: self.statistics_interval.unwrap_or(Duration::from_secs(1)),
            auto_offset_reset: self.auto_offset_reset.unwrap_or(OffsetReset::Latest),
            buffer_size: self.buffer_size.unwrap_or(1000).max(1),
            topic_partitions: self.topic_partitions.unwrap_or(1),
            replication_factor: self.replication_factor.unwrap_or(1),
            brokers,
            client_id,
        };

        tracing::info!(
            brokers = %broker.brokers,
            acks = %acks,
            compression = %compression,
            buffer_size = broker.buffer_size,
            auto_offset_reset = broker.auto_offset_reset.as_str(),
            "RedpandaBroker created successfully"
        );

        Ok(broker)
    }
}

impl Broker for RedpandaBroker {
    fn connect_admin(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            // librdkafka connects lazily; a metadata round trip proves the
            // cluster answers.
            let admin = Arc::clone(&self.admin);
            let timeout = self.timeout;
            let metadata =
                tokio::task::spawn_blocking(move || admin.inner().fetch_metadata(None, timeout))
                    .await
                    .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?
                    .map_err(|e| {
                        BrokerError::ConnectionFailed(format!("Failed to reach brokers: {e}"))
                    })?;

            tracing::info!(
                brokers = %self.brokers,
                cluster_brokers = metadata.brokers().len(),
                "Admin connected"
            );
            Ok(())
        })
    }

    fn disconnect_admin(&self) -> BrokerFuture<'_, ()> {
        // The admin client lives as long as the broker; nothing to release.
        Box::pin(async move {
            tracing::debug!(brokers = %self.brokers, "Admin disconnected");
            Ok(())
        })
    }

    fn create_topic<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let topic = NewTopic::new(
                name,
                self.topic_partitions,
                TopicReplication::Fixed(self.replication_factor),
            );
            let results = self
                .admin
                .create_topics(&[topic], &self.admin_options())
                .await
                .map_err(|e| BrokerError::AdminFailed(format!("create topic '{name}': {e}")))?;

            for result in results {
                match result {
                    Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {},
                    Err((topic, code)) => {
                        return Err(BrokerError::AdminFailed(format!(
                            "create topic '{topic}': {code}"
                        )));
                    },
                }
            }

            tracing::debug!(topic = %name, "Topic created");
            Ok(())
        })
    }

    fn delete_topic<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let results = self
                .admin
                .delete_topics(&[name], &self.admin_options())
                .await
                .map_err(|e| BrokerError::AdminFailed(format!("delete topic '{name}': {e}")))?;

            for result in results {
                match result {
                    Ok(_) => {},
                    Err((topic, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                        return Err(BrokerError::TopicNotFound(topic));
                    },
                    Err((topic, code)) => {
                        return Err(BrokerError::AdminFailed(format!(
                            "delete topic '{topic}': {code}"
                        )));
                    },
                }
            }

            tracing::debug!(topic = %name, "Topic deleted");
            Ok(())
        })
    }

    fn consumer(&self, group_id: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if group_id.is_empty() {
            return Err(BrokerError::ConsumerGroup("group id is empty".to_string()));
        }
        Ok(Box::new(RedpandaConsumer::new(ConsumerSettings {
            brokers: self.brokers.clone(),
            client_id: self.client_id.clone(),
            group_id: group_id.to_string(),
            default_reset: self.auto_offset_reset,
            session_timeout: self.session_timeout,
            statistics_interval: self.statistics_interval,
            operation_timeout: self.timeout,
            buffer_size: self.buffer_size,
        })))
    }

    fn producer(&self) -> Result<Box<dyn BrokerProducer>, BrokerError> {
        Ok(Box::new(RedpandaProducer::new(
            self.producer_config.clone(),
            self.timeout,
        )))
    }
}

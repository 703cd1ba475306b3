//! The messaging client: lifecycle, publish and request/reply.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──connect()──► Connecting ──ok──► Running ──shutdown()──► Draining ──► Disconnected
//!       ▲                           │
//!       └────────── error ──────────┘
//! ```
//!
//! `connect()` opens the admin channel and the main consumer, subscribes
//! every registered topic and spawns the dispatch loop (see
//! [`dispatch`](crate::dispatch)). Publishing and request/reply use
//! per-call producers and consumers, so they never share broker resources
//! with the dispatch loop or with each other.
//!
//! # Request/Reply
//!
//! A request is published with a fresh trace id; the reply is read from the
//! ephemeral topic `<topic>.response.<traceId>`, created and deleted by the
//! call itself:
//!
//! ```text
//! caller                         broker                       replier
//!   │ create consumer (group = reply topic)                       │
//!   │ connect, create reply topic, subscribe from beginning       │
//!   │── publish request ────────►│── deliver ──────────────────►│
//!   │                            │◄──── publish reply ──────────│
//!   │◄── first message ──────────│                               │
//!   │ disconnect consumer, delete reply topic (always)            │
//! ```

use crate::health::HealthCheck;
use crate::metrics::MessagingMetrics;
use busline_core::broker::{Broker, BrokerConsumer, BrokerError, DeliveryOptions, MessageStream};
use busline_core::config::MessagingConfig;
use busline_core::envelope::{self, Envelope, EnvelopeBase, EnvelopeOptions, create_envelope_at};
use busline_core::environment::{Clock, SystemClock};
use busline_core::error::{CleanupFailure, MessagingError};
use busline_core::liveness::{HeartbeatTracker, LivenessMonitor};
use busline_core::registry::SubscriptionRegistry;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Component name reported by [`MessagingClient::health_check`].
pub const HEALTH_COMPONENT: &str = "messaging";

/// Dispatch failures buffered for [`MessagingClient::take_failures`].
const FAILURE_BUFFER: usize = 1024;

/// Lifecycle state of a [`MessagingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Built, not yet connected
    Uninitialized,
    /// `connect()` in progress
    Connecting,
    /// Consumer subscribed, dispatch loop running
    Running,
    /// `shutdown()` in progress
    Draining,
    /// Shut down; the client cannot be reconnected
    Disconnected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Connecting => write!(f, "connecting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A handler or reply failure observed by the background dispatch loop.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Topic the message arrived on
    pub topic: String,
    /// What went wrong
    pub error: MessagingError,
}

/// Builder for [`MessagingClient`].
pub struct MessagingClientBuilder {
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    clock: Arc<dyn Clock>,
    registry: SubscriptionRegistry<MessagingClient>,
}

impl MessagingClientBuilder {
    /// Use the given configuration (default: [`MessagingConfig::default`]).
    #[must_use]
    pub fn config(mut self, config: MessagingConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given clock for envelope timestamps and heartbeat staleness.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use the given (frozen) subscription table.
    #[must_use]
    pub fn registry(mut self, registry: SubscriptionRegistry<MessagingClient>) -> Self {
        self.registry = registry;
        self
    }

    /// Build the client. Nothing is connected until [`MessagingClient::connect`].
    #[must_use]
    pub fn build(self) -> MessagingClient {
        let liveness = LivenessMonitor::new(
            HeartbeatTracker::new(),
            self.config.request_timeout,
            Arc::clone(&self.clock),
        );
        let (shutdown, _) = watch::channel(false);
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_BUFFER);

        MessagingClient {
            inner: Arc::new(Inner {
                broker: self.broker,
                registry: self.registry,
                config: self.config,
                clock: self.clock,
                liveness,
                state: Mutex::new(ClientState::Uninitialized),
                consumer: Mutex::new(None),
                dispatch_task: Mutex::new(None),
                shutdown,
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
            }),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) registry: SubscriptionRegistry<MessagingClient>,
    pub(crate) config: MessagingConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) liveness: LivenessMonitor,
    pub(crate) state: Mutex<ClientState>,
    pub(crate) consumer: Mutex<Option<Arc<dyn BrokerConsumer>>>,
    pub(crate) dispatch_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) failures_tx: mpsc::Sender<DispatchFailure>,
    pub(crate) failures_rx: Mutex<Option<mpsc::Receiver<DispatchFailure>>>,
}

/// Messaging client over a [`Broker`].
///
/// Cheap to clone; clones share the same connection, registry and dispatch loop.
/// Handlers receive a clone in [`Delivery::client`](busline_core::registry::Delivery)
/// and can publish or issue requests of their own.
///
/// # Example
///
/// ```ignore
/// let mut registry = RegistryBuilder::<MessagingClient>::new();
/// registry.register("math.add", add_handler, SubscribeOptions::default().expects_reply(true))?;
///
/// let client = MessagingClient::builder(broker)
///     .config(MessagingConfig::from_env()?)
///     .registry(registry.freeze())
///     .build();
///
/// client.connect().await?;
/// let sum: i64 = client.request("math.add", json!({ "a": 1, "b": 2 })).await?;
/// client.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct MessagingClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connection_error(error: &BrokerError) -> MessagingError {
    MessagingError::Connection(error.to_string())
}

impl MessagingClient {
    /// Start building a client over `broker`.
    #[must_use]
    pub fn builder(broker: Arc<dyn Broker>) -> MessagingClientBuilder {
        MessagingClientBuilder {
            broker,
            config: MessagingConfig::default(),
            clock: Arc::new(SystemClock),
            registry: SubscriptionRegistry::default(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *lock(&self.inner.state)
    }

    /// The configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// The subscription table.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry<Self> {
        &self.inner.registry
    }

    /// The liveness monitor fed by the main consumer's heartbeats.
    #[must_use]
    pub fn liveness(&self) -> &LivenessMonitor {
        &self.inner.liveness
    }

    fn transition(&self, from: ClientState, to: ClientState) -> Result<(), MessagingError> {
        let mut state = lock(&self.inner.state);
        if *state != from {
            return Err(MessagingError::InvalidState {
                expected: from.to_string(),
                actual: state.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: ClientState) {
        *lock(&self.inner.state) = to;
    }

    /// Connect to the broker and start dispatching.
    ///
    /// Opens the admin channel, joins the configured consumer group,
    /// subscribes every registered topic (honouring `from_beginning`) and
    /// spawns the dispatch loop. There is no internal retry.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidState`] unless the client is `Uninitialized`
    /// - [`MessagingError::Connection`] if any step fails; the client returns
    ///   to `Uninitialized` and partially opened connections are closed
    pub async fn connect(&self) -> Result<(), MessagingError> {
        self.transition(ClientState::Uninitialized, ClientState::Connecting)?;
        tracing::info!(
            group_id = %self.inner.config.group_id,
            topics = self.inner.registry.len(),
            "Connecting messaging client"
        );

        match self.start().await {
            Ok(()) => {
                self.set_state(ClientState::Running);
                tracing::info!(group_id = %self.inner.config.group_id, "Messaging client running");
                Ok(())
            },
            Err(e) => {
                self.set_state(ClientState::Uninitialized);
                tracing::error!(error = %e, "Failed to connect messaging client");
                Err(e)
            },
        }
    }

    async fn start(&self) -> Result<(), MessagingError> {
        self.inner
            .broker
            .connect_admin()
            .await
            .map_err(|e| connection_error(&e))?;

        let (consumer, stream) = match self.start_consumer().await {
            Ok(started) => started,
            Err(e) => {
                if let Err(admin) = self.inner.broker.disconnect_admin().await {
                    tracing::warn!(error = %admin, "Failed to close admin connection after failed connect");
                }
                return Err(e);
            },
        };

        *lock(&self.inner.consumer) = Some(consumer);
        let task = tokio::spawn(self.clone().dispatch_loop(stream, self.inner.shutdown.subscribe()));
        *lock(&self.inner.dispatch_task) = Some(task);
        Ok(())
    }

    async fn start_consumer(
        &self,
    ) -> Result<(Arc<dyn BrokerConsumer>, MessageStream), MessagingError> {
        let consumer: Arc<dyn BrokerConsumer> = Arc::from(
            self.inner
                .broker
                .consumer(&self.inner.config.group_id)
                .map_err(|e| connection_error(&e))?,
        );

        let heartbeats = self.inner.liveness.heartbeats().clone();
        consumer.on_heartbeat(Arc::new(move |at| heartbeats.record(at)));
        consumer.connect().await.map_err(|e| connection_error(&e))?;

        let subscribed = async {
            for (topic, entry) in self.inner.registry.iter() {
                consumer.subscribe(topic, entry.options.from_beginning).await?;
                tracing::debug!(
                    topic,
                    from_beginning = entry.options.from_beginning,
                    expects_reply = entry.options.expects_reply,
                    "Subscribed"
                );
            }
            consumer.run().await
        }
        .await;

        match subscribed {
            Ok(stream) => Ok((consumer, stream)),
            Err(e) => {
                if let Err(disconnect) = consumer.disconnect().await {
                    tracing::warn!(error = %disconnect, "Failed to disconnect consumer after failed connect");
                }
                Err(connection_error(&e))
            },
        }
    }

    /// Stop dispatching and release the broker connections.
    ///
    /// Waits for the message being dispatched (if any) to finish, then
    /// disconnects the main consumer and the admin channel. Both are
    /// attempted even if the first fails.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidState`] unless the client is `Running`
    /// - [`MessagingError::Connection`] listing every disconnect failure; the
    ///   client is `Disconnected` regardless
    pub async fn shutdown(&self) -> Result<(), MessagingError> {
        self.transition(ClientState::Running, ClientState::Draining)?;
        tracing::info!("Shutting down messaging client");

        self.inner.shutdown.send_replace(true);
        let task = lock(&self.inner.dispatch_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        let mut errors = Vec::new();
        let consumer = lock(&self.inner.consumer).take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.disconnect().await {
                errors.push(format!("consumer: {e}"));
            }
        }
        if let Err(e) = self.inner.broker.disconnect_admin().await {
            errors.push(format!("admin: {e}"));
        }

        self.set_state(ClientState::Disconnected);
        if errors.is_empty() {
            tracing::info!("Messaging client disconnected");
            Ok(())
        } else {
            let message = errors.join("; ");
            tracing::error!(errors = %message, "Messaging client disconnected with errors");
            Err(MessagingError::Connection(message))
        }
    }

    /// Take the receiving end of the dispatch failure channel.
    ///
    /// Returns `None` after the first call. Failures beyond the buffer
    /// capacity are logged and dropped while nobody drains the channel.
    #[must_use]
    pub fn take_failures(&self) -> Option<mpsc::Receiver<DispatchFailure>> {
        lock(&self.inner.failures_rx).take()
    }

    /// Create an envelope stamped with this client's clock.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Validation`] if the base is invalid.
    pub fn create_envelope<T>(
        &self,
        base: EnvelopeBase<T>,
        options: EnvelopeOptions,
    ) -> Result<Envelope<T>, MessagingError> {
        create_envelope_at(base, options, self.inner.clock.as_ref())
    }

    /// Publish an envelope to its topic (fire-and-forget).
    ///
    /// A dedicated producer is opened for the call and always disconnected
    /// afterwards, also when this future is dropped before it completes.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Validation`] if the envelope is malformed (nothing is sent)
    /// - [`MessagingError::Connection`] if the producer cannot connect
    /// - [`MessagingError::Broker`] if the broker rejects the message
    /// - [`MessagingError::Cleanup`] if the message was published but the
    ///   producer failed to disconnect
    pub async fn send<T: Serialize + Sync>(
        &self,
        envelope: &Envelope<T>,
        options: &DeliveryOptions,
    ) -> Result<(), MessagingError> {
        envelope.validate()?;
        let payload = envelope::encode(envelope)?;
        let topic = envelope.topic();

        let producer = self
            .inner
            .broker
            .producer()
            .map_err(|e| connection_error(&e))?;
        // The producer lives in its own task so it is disconnected even when
        // the caller stops waiting (e.g. a request_reply timeout).
        let lifecycle = tokio::spawn({
            let topic = topic.to_string();
            let options = options.clone();
            async move {
                let published = match producer.connect().await {
                    Ok(()) => producer
                        .publish(&topic, &payload, &options)
                        .await
                        .map_err(MessagingError::from),
                    Err(e) => Err(connection_error(&e)),
                };
                let released = producer.disconnect().await;
                (published, released, payload)
            }
        });
        let (published, released, payload) = lifecycle
            .await
            .map_err(|e| MessagingError::Connection(format!("producer task failed: {e}")))?;

        match (published, released) {
            (Ok(()), Ok(())) => {
                MessagingMetrics::record_publish();
                tracing::debug!(topic, trace_id = envelope.trace_id(), "Published envelope");
                Ok(())
            },
            (Ok(()), Err(source)) => {
                MessagingMetrics::record_publish();
                tracing::warn!(topic, error = %source, "Published envelope but producer failed to disconnect");
                Err(MessagingError::Cleanup {
                    topic: topic.to_string(),
                    outcome: Box::new(envelope::decode(&payload)),
                    failures: vec![CleanupFailure::Producer { source }],
                })
            },
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(source)) => {
                tracing::warn!(topic, error = %source, "Failed to disconnect producer after failed publish");
                Err(e)
            },
        }
    }

    /// Publish a request and wait for its reply.
    ///
    /// The reply topic is created before the request is published and
    /// deleted afterwards, whatever the outcome. Connecting, creating the
    /// topic, subscribing, publishing and waiting all share the one
    /// `timeout`; cleanup is not bounded by it and always completes before
    /// this returns.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Validation`] if the base is invalid (nothing is created)
    /// - [`MessagingError::Timeout`] naming the request topic if no reply arrived in time
    /// - [`MessagingError::Remote`] if the reply carries an error
    /// - [`MessagingError::Connection`] / [`MessagingError::Broker`] for transport failures
    /// - [`MessagingError::Cleanup`] if releasing the reply consumer or topic
    ///   failed; the primary outcome is kept inside
    pub async fn request_reply<T: Serialize + Send + Sync>(
        &self,
        base: EnvelopeBase<T>,
        options: &DeliveryOptions,
        timeout: Duration,
    ) -> Result<Envelope, MessagingError> {
        let started = Instant::now();
        let request = self.create_envelope(base, EnvelopeOptions::client_request())?;
        let topic = request.topic().to_string();
        let reply_topic = request.response_to().to_string();

        let consumer = self
            .inner
            .broker
            .consumer(&reply_topic)
            .map_err(|e| connection_error(&e))?;
        tracing::debug!(
            topic = %topic,
            trace_id = request.trace_id(),
            reply_topic = %reply_topic,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Sending request"
        );

        let mut failures = Vec::new();
        let primary = match tokio::time::timeout(
            timeout,
            self.exchange(consumer.as_ref(), &request, options, &mut failures),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(topic = %topic, trace_id = request.trace_id(), "Request timed out");
                Err(MessagingError::Timeout {
                    topic: topic.clone(),
                })
            },
        };

        failures.extend(self.release_reply_resources(consumer.as_ref(), &reply_topic).await);
        MessagingMetrics::record_request_reply(
            started.elapsed(),
            primary.as_ref().is_err_and(MessagingError::is_timeout),
        );

        if failures.is_empty() {
            primary
        } else {
            Err(MessagingError::Cleanup {
                topic,
                outcome: Box::new(primary),
                failures,
            })
        }
    }

    async fn exchange<T: Serialize + Sync>(
        &self,
        consumer: &dyn BrokerConsumer,
        request: &Envelope<T>,
        options: &DeliveryOptions,
        failures: &mut Vec<CleanupFailure>,
    ) -> Result<Envelope, MessagingError> {
        let reply_topic = request.response_to();
        consumer.connect().await.map_err(|e| connection_error(&e))?;
        self.inner.broker.create_topic(reply_topic).await?;
        consumer.subscribe(reply_topic, true).await?;
        let mut replies = consumer.run().await?;

        match self.send(request, options).await {
            Ok(()) => {},
            // Published; only the producer teardown failed. Keep waiting.
            Err(MessagingError::Cleanup {
                failures: publish_failures,
                outcome,
                ..
            }) if outcome.is_ok() => failures.extend(publish_failures),
            Err(e) => return Err(e),
        }

        while let Some(next) = replies.next().await {
            let message = match next {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(reply_topic, error = %e, "Error receiving reply");
                    continue;
                },
            };
            let Some(payload) = message.payload.as_deref() else {
                continue;
            };
            match envelope::decode::<Value>(payload) {
                Ok(reply) => {
                    tracing::debug!(reply_topic, trace_id = reply.trace_id(), "Received reply");
                    return match reply.error() {
                        Some(error) => Err(MessagingError::Remote(error.clone())),
                        None => Ok(reply),
                    };
                },
                Err(e) => tracing::warn!(reply_topic, error = %e, "Ignoring undecodable reply"),
            }
        }

        Err(MessagingError::Connection(format!(
            "reply stream for '{reply_topic}' closed before a reply arrived"
        )))
    }

    async fn release_reply_resources(
        &self,
        consumer: &dyn BrokerConsumer,
        reply_topic: &str,
    ) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        if let Err(source) = consumer.disconnect().await {
            tracing::warn!(reply_topic, error = %source, "Failed to disconnect reply consumer");
            failures.push(CleanupFailure::Disconnect {
                group_id: reply_topic.to_string(),
                source,
            });
        }

        match self.inner.broker.delete_topic(reply_topic).await {
            Ok(()) | Err(BrokerError::TopicNotFound(_)) => {},
            Err(source) => {
                tracing::warn!(reply_topic, error = %source, "Failed to delete reply topic");
                failures.push(CleanupFailure::DeleteTopic {
                    topic: reply_topic.to_string(),
                    source,
                });
            },
        }

        failures
    }

    /// [`request_reply`](Self::request_reply) with the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`request_reply`](Self::request_reply).
    pub async fn request_reply_with_default_timeout<T: Serialize + Send + Sync>(
        &self,
        base: EnvelopeBase<T>,
        options: &DeliveryOptions,
    ) -> Result<Envelope, MessagingError> {
        self.request_reply(base, options, self.inner.config.request_timeout)
            .await
    }

    /// Typed request/reply with the configured timeout.
    ///
    /// A reply without data is deserialized from `null`.
    ///
    /// # Errors
    ///
    /// See [`request_reply`](Self::request_reply); additionally
    /// [`MessagingError::Decode`] if the reply data does not match `Resp`.
    pub async fn request<Req, Resp>(
        &self,
        topic: impl Into<String>,
        data: Req,
    ) -> Result<Resp, MessagingError>
    where
        Req: Serialize + Send + Sync,
        Resp: DeserializeOwned,
    {
        let reply = self
            .request_reply_with_default_timeout(
                EnvelopeBase::new(topic).with_data(data),
                &DeliveryOptions::default(),
            )
            .await?;
        let value = reply.into_data().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| MessagingError::Decode(e.to_string()))
    }

    /// Liveness verdict of the main consumer.
    ///
    /// Healthy when the last heartbeat is younger than the configured
    /// timeout; otherwise only while the consumer group is rebalancing.
    pub async fn is_healthy(&self) -> bool {
        let consumer = lock(&self.inner.consumer).clone();
        self.inner
            .liveness
            .is_healthy(|| async move {
                match consumer {
                    Some(consumer) => consumer.describe_group().await,
                    None => Err(BrokerError::ConsumerGroup(
                        "messaging client is not connected".to_string(),
                    )),
                }
            })
            .await
    }

    /// Liveness verdict in [`HealthCheck`] form.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let check = if state != ClientState::Running {
            HealthCheck::unhealthy(HEALTH_COMPONENT, format!("client is {state}"))
        } else if self.is_healthy().await {
            HealthCheck::healthy(HEALTH_COMPONENT)
        } else {
            HealthCheck::unhealthy(
                HEALTH_COMPONENT,
                "consumer heartbeat is stale and the group is not rebalancing",
            )
        };

        let last_heartbeat = self
            .inner
            .liveness
            .heartbeats()
            .last_millis()
            .map_or_else(|| "never".to_string(), |millis| millis.to_string());
        check
            .with_metadata("state", state.to_string())
            .with_metadata("group_id", self.inner.config.group_id.clone())
            .with_metadata("last_heartbeat_ms", last_heartbeat)
    }
}

impl fmt::Debug for MessagingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingClient")
            .field("state", &self.state())
            .field("group_id", &self.inner.config.group_id)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

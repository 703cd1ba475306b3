//! Consumer-group member backed by rdkafka's [`StreamConsumer`].
//!
//! Kafka applies `auto.offset.reset` per client, not per topic. A
//! [`RedpandaConsumer`] therefore keeps one rdkafka consumer per reset
//! policy, all in the same group: topics subscribed `from_beginning` go to
//! the `earliest` member, the rest to the member using the configured
//! default. [`run`](BrokerConsumer::run) merges their streams.

use busline_core::broker::{
    BrokerConsumer, BrokerError, BrokerFuture, GroupState, HeartbeatObserver, InboundMessage,
    MessageStream,
};
use busline_core::config::OffsetReset;
use chrono::Utc;
use futures::StreamExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::statistics::Statistics;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// librdkafka join state of a member that holds its assignment.
const STEADY_JOIN_STATE: &str = "steady";

/// Client context that turns librdkafka statistics into heartbeats.
///
/// Statistics are emitted every `statistics.interval.ms`. An emission while
/// the member is joined and steady counts as a heartbeat; during a rebalance
/// the member is not steady and heartbeats stop.
#[derive(Clone, Default)]
pub(crate) struct HeartbeatContext {
    observer: Arc<RwLock<Option<HeartbeatObserver>>>,
}

impl HeartbeatContext {
    fn set(&self, observer: HeartbeatObserver) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }
}

impl ClientContext for HeartbeatContext {
    fn stats(&self, statistics: Statistics) {
        let Some(cgrp) = statistics.cgrp else {
            return;
        };
        if cgrp.state != "up" || cgrp.join_state != STEADY_JOIN_STATE {
            tracing::trace!(
                state = %cgrp.state,
                join_state = %cgrp.join_state,
                "Consumer group member not steady"
            );
            return;
        }

        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(Utc::now());
        }
    }
}

impl ConsumerContext for HeartbeatContext {}

type GroupConsumer = StreamConsumer<HeartbeatContext>;

/// Settings shared by every member of one [`RedpandaConsumer`].
#[derive(Clone, Debug)]
pub(crate) struct ConsumerSettings {
    pub(crate) brokers: String,
    pub(crate) client_id: String,
    pub(crate) group_id: String,
    pub(crate) default_reset: OffsetReset,
    pub(crate) session_timeout: Duration,
    pub(crate) statistics_interval: Duration,
    pub(crate) operation_timeout: Duration,
    pub(crate) buffer_size: usize,
}

struct Member {
    reset: OffsetReset,
    consumer: Arc<GroupConsumer>,
    topics: Vec<String>,
}

#[derive(Default)]
struct Members {
    connected: bool,
    running: bool,
    members: Vec<Member>,
}

impl Members {
    fn any(&self) -> Option<Arc<GroupConsumer>> {
        self.members.first().map(|m| Arc::clone(&m.consumer))
    }
}

/// A consumer-group member on a Kafka-compatible cluster.
pub struct RedpandaConsumer {
    settings: ConsumerSettings,
    context: HeartbeatContext,
    members: Mutex<Members>,
    stop: watch::Sender<bool>,
}

impl RedpandaConsumer {
    pub(crate) fn new(settings: ConsumerSettings) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            settings,
            context: HeartbeatContext::default(),
            members: Mutex::new(Members::default()),
            stop,
        }
    }

    /// The consumer group this member joins.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.settings.group_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_member(&self, reset: OffsetReset) -> Result<Member, BrokerError> {
        let consumer: GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("client.id", &self.settings.client_id)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset.as_str())
            .set(
                "session.timeout.ms",
                self.settings.session_timeout.as_millis().to_string(),
            )
            .set(
                "statistics.interval.ms",
                self.settings.statistics_interval.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false")
            .create_with_context(self.context.clone())
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}"))
            })?;

        Ok(Member {
            reset,
            consumer: Arc::new(consumer),
            topics: Vec::new(),
        })
    }
}

impl BrokerConsumer for RedpandaConsumer {
    fn connect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let consumer = {
                let mut members = self.lock();
                if members.connected {
                    return Ok(());
                }
                if members.members.is_empty() {
                    let member = self.create_member(self.settings.default_reset)?;
                    members.members.push(member);
                }
                members.any()
            };
            let Some(consumer) = consumer else {
                return Err(BrokerError::ConnectionFailed(
                    "consumer has no members".to_string(),
                ));
            };

            // The group is only joined on subscribe; fetching metadata proves
            // the bootstrap servers answer.
            let timeout = self.settings.operation_timeout;
            tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to reach brokers: {e}"))
                })?;

            self.lock().connected = true;
            tracing::info!(
                group_id = %self.settings.group_id,
                brokers = %self.settings.brokers,
                "Consumer connected"
            );
            Ok(())
        })
    }

    fn on_heartbeat(&self, observer: HeartbeatObserver) {
        self.context.set(observer);
    }

    fn subscribe<'a>(&'a self, topic: &'a str, from_beginning: bool) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let reset = if from_beginning {
                OffsetReset::Earliest
            } else {
                self.settings.default_reset
            };

            let mut members = self.lock();
            if !members.connected {
                return Err(BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "consumer is not connected".to_string(),
                });
            }
            if members.running {
                return Err(BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "consumer is already running".to_string(),
                });
            }

            let index = match members.members.iter().position(|m| m.reset == reset) {
                Some(index) => index,
                None => {
                    let member = self.create_member(reset)?;
                    members.members.push(member);
                    members.members.len() - 1
                },
            };
            let member = &mut members.members[index];
            if !member.topics.iter().any(|t| t == topic) {
                member.topics.push(topic.to_string());
            }

            // rdkafka replaces the whole subscription on every call.
            let topics: Vec<&str> = member.topics.iter().map(String::as_str).collect();
            member
                .consumer
                .subscribe(&topics)
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

            tracing::info!(
                topic = %topic,
                group_id = %self.settings.group_id,
                auto_offset_reset = reset.as_str(),
                "Subscribed to topic"
            );
            Ok(())
        })
    }

    fn run(&self) -> BrokerFuture<'_, MessageStream> {
        Box::pin(async move {
            let consumers: Vec<Arc<GroupConsumer>> = {
                let mut members = self.lock();
                if !members.connected {
                    return Err(BrokerError::Transport("consumer is not connected".to_string()));
                }
                if members.running {
                    return Err(BrokerError::Transport(
                        "consumer is already running".to_string(),
                    ));
                }
                members.running = true;
                members
                    .members
                    .iter()
                    .filter(|m| !m.topics.is_empty())
                    .map(|m| Arc::clone(&m.consumer))
                    .collect()
            };

            self.stop.send_replace(false);
            let (tx, rx) = mpsc::channel(self.settings.buffer_size);
            for consumer in consumers {
                tokio::spawn(forward(consumer, tx.clone(), self.stop.subscribe()));
            }
            drop(tx);

            tracing::debug!(group_id = %self.settings.group_id, "Consumer running");

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn describe_group(&self) -> BrokerFuture<'_, GroupState> {
        Box::pin(async move {
            let Some(consumer) = self.lock().any() else {
                return Err(BrokerError::ConsumerGroup(
                    "consumer is not connected".to_string(),
                ));
            };
            let group = self.settings.group_id.clone();
            let timeout = self.settings.operation_timeout;

            // `GroupList` is not `Send`, so resolve the state on the blocking thread.
            let state = tokio::task::spawn_blocking(move || {
                consumer.fetch_group_list(Some(&group), timeout).map(|list| {
                    list.groups()
                        .iter()
                        .find(|g| g.name() == group)
                        .map(|g| GroupState::parse(g.state()))
                })
            })
            .await
            .map_err(|e| BrokerError::ConsumerGroup(e.to_string()))?
            .map_err(|e| BrokerError::ConsumerGroup(format!("Failed to describe group: {e}")))?;

            state.ok_or_else(|| {
                    BrokerError::ConsumerGroup(format!(
                        "group '{}' not known to the coordinator",
                        self.settings.group_id
                    ))
                })
        })
    }

    fn disconnect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.stop.send_replace(true);

            let members = std::mem::take(&mut *self.lock());
            for member in &members.members {
                if !member.topics.is_empty() {
                    member.consumer.unsubscribe();
                }
            }
            drop(members);

            tracing::info!(group_id = %self.settings.group_id, "Consumer disconnected");
            Ok(())
        })
    }
}

/// Forward one member's messages into the shared channel until stopped.
///
/// Offsets are committed after the message reaches the channel, so a crash
/// before the commit redelivers it.
async fn forward(
    consumer: Arc<GroupConsumer>,
    tx: mpsc::Sender<Result<InboundMessage, BrokerError>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut stream = consumer.stream();

    while !*stop.borrow() {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(message)) => {
                    let inbound = InboundMessage {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        payload: message.payload().map(<[u8]>::to_vec),
                    };
                    tracing::trace!(
                        topic = inbound.topic,
                        partition = inbound.partition,
                        offset = inbound.offset,
                        "Received message"
                    );

                    if tx.send(Ok(inbound)).await.is_err() {
                        tracing::debug!("Channel receiver dropped, exiting consumer task");
                        break;
                    }

                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to commit offset (message may be redelivered)"
                        );
                    }
                },
                Some(Err(e)) => {
                    let err = BrokerError::Transport(format!("Failed to receive message: {e}"));
                    if tx.send(Err(err)).await.is_err() {
                        break;
                    }
                },
                None => break,
            },
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Consumer task exiting");
}

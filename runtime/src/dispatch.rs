//! Inbound message dispatch.
//!
//! One dispatch loop runs per connected client. It fans messages out to one
//! lane per topic-partition: a lane handles its messages strictly one at a
//! time in arrival order, while different lanes run concurrently, so a slow
//! handler only holds up its own topic-partition. Each message goes through:
//!
//! 1. Decode the payload (undecodable messages are logged and dropped)
//! 2. Resolve the handler by topic (unknown topics are logged and dropped)
//! 3. Invoke the handler with the client and the envelope
//! 4. If the subscription expects a reply, publish exactly one reply to
//!    the envelope's `responseTo` carrying the value or the failure
//! 5. Escalate handler and reply failures to
//!    [`take_failures`](crate::MessagingClient::take_failures)

use crate::client::{DispatchFailure, MessagingClient};
use crate::metrics::MessagingMetrics;
use busline_core::broker::{DeliveryOptions, InboundMessage, MessageStream};
use busline_core::envelope::{self, Envelope, SerializedError};
use busline_core::error::MessagingError;
use busline_core::registry::{Delivery, HandlerError};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Messages buffered per topic-partition before the consumer waits.
const LANE_BUFFER: usize = 64;

/// A topic-partition; messages sharing one are dispatched in order.
type LaneKey = (String, i32);

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler processed the message
    Handled {
        /// Whether a reply was published
        replied: bool,
    },
    /// No handler is registered for the topic; the message was dropped
    Unrouted,
}

impl MessagingClient {
    /// Dispatch one inbound message.
    ///
    /// The dispatch loop calls this for every message; it is public so a
    /// custom consumption loop can reuse the same routing and reply rules.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Decode`] if the payload is not an envelope
    /// - [`MessagingError::HandlerFailed`] if the handler failed; the failure
    ///   reply (when expected) has already been published
    /// - Any [`send`](Self::send) error if publishing a successful reply failed
    pub async fn dispatch(&self, message: InboundMessage) -> Result<Dispatched, MessagingError> {
        let Some(payload) = message.payload.as_deref() else {
            return Err(MessagingError::Decode(format!(
                "message on '{}' (partition {}, offset {}) has no payload",
                message.topic, message.partition, message.offset
            )));
        };
        let envelope: Envelope<Value> = envelope::decode(payload)?;

        let Some(entry) = self.inner.registry.resolve(&message.topic) else {
            tracing::warn!(
                topic = %message.topic,
                trace_id = envelope.trace_id(),
                "No handler registered for topic, dropping message"
            );
            return Ok(Dispatched::Unrouted);
        };

        tracing::debug!(
            topic = %message.topic,
            trace_id = envelope.trace_id(),
            partition = message.partition,
            offset = message.offset,
            "Dispatching message"
        );
        MessagingMetrics::record_dispatch();

        let request = entry.options.expects_reply.then(|| envelope.clone());
        let invocation = (entry.handler)(Delivery {
            client: self.clone(),
            envelope,
        });
        // A panicking handler surfaces as a failure instead of ending the loop.
        let outcome = match tokio::spawn(invocation).await {
            Ok(outcome) => outcome,
            Err(join) => Err(HandlerError::new("HandlerPanicked", join.to_string())),
        }
        .map_err(SerializedError::from);

        let Some(request) = request else {
            return match outcome {
                Ok(_) => Ok(Dispatched::Handled { replied: false }),
                Err(error) => Err(MessagingError::HandlerFailed {
                    topic: message.topic,
                    error,
                }),
            };
        };

        let published = self.publish_reply(&request, outcome.clone()).await;
        match (outcome, published) {
            (Ok(_), Ok(())) => Ok(Dispatched::Handled { replied: true }),
            (Ok(_), Err(e)) => Err(e),
            (Err(error), published) => {
                if let Err(e) = published {
                    tracing::error!(
                        topic = %message.topic,
                        trace_id = request.trace_id(),
                        error = %e,
                        "Failed to publish failure reply"
                    );
                }
                Err(MessagingError::HandlerFailed {
                    topic: message.topic,
                    error,
                })
            },
        }
    }

    async fn publish_reply(
        &self,
        request: &Envelope<Value>,
        outcome: Result<Value, SerializedError>,
    ) -> Result<(), MessagingError> {
        let reply = request.reply(outcome, self.inner.clock.as_ref())?;
        self.send(&reply, &DeliveryOptions::default()).await?;
        tracing::debug!(
            reply_topic = reply.topic(),
            trace_id = request.trace_id(),
            failed = reply.error().is_some(),
            "Published reply"
        );
        Ok(())
    }

    pub(crate) async fn dispatch_loop(
        self,
        mut stream: MessageStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(group_id = %self.inner.config.group_id, "Dispatch loop started");

        let mut lanes: HashMap<LaneKey, mpsc::Sender<InboundMessage>> = HashMap::new();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while !*shutdown.borrow() {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let key = (message.topic.clone(), message.partition);
                        let lane = lanes.entry(key).or_insert_with_key(|key| {
                            let (tx, rx) = mpsc::channel(LANE_BUFFER);
                            workers.push(tokio::spawn(
                                self.clone().run_lane(key.clone(), rx, shutdown.clone()),
                            ));
                            tx
                        });
                        if lane.send(message).await.is_err() {
                            tracing::warn!("Dispatch lane closed, dropping message");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Error receiving message from broker");
                    },
                    None => {
                        tracing::info!("Message stream ended");
                        break;
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        // Closing the lanes lets every worker finish its in-flight handler.
        drop(lanes);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Dispatch lane ended abnormally");
            }
        }

        tracing::info!(group_id = %self.inner.config.group_id, "Dispatch loop stopped");
    }

    /// Dispatch one topic-partition's messages in arrival order.
    async fn run_lane(
        self,
        (topic, partition): LaneKey,
        mut messages: mpsc::Receiver<InboundMessage>,
        shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(topic = %topic, partition, "Dispatch lane started");
        while let Some(message) = messages.recv().await {
            if *shutdown.borrow() {
                break;
            }
            self.dispatch_and_report(message).await;
        }
        tracing::debug!(topic = %topic, partition, "Dispatch lane stopped");
    }

    async fn dispatch_and_report(&self, message: InboundMessage) {
        let topic = message.topic.clone();
        match self.dispatch(message).await {
            Ok(_) => {},
            Err(MessagingError::Decode(reason)) => {
                tracing::error!(topic = %topic, reason = %reason, "Dropping undecodable message");
            },
            Err(error) => {
                MessagingMetrics::record_dispatch_failure();
                tracing::error!(topic = %topic, error = %error, "Dispatch failed");
                match self.inner.failures_tx.try_send(DispatchFailure { topic, error }) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {},
                    Err(TrySendError::Full(dropped)) => {
                        tracing::warn!(topic = %dropped.topic, "Dispatch failure channel full, dropping failure");
                    },
                }
            },
        }
    }
}

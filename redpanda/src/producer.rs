//! Publisher backed by rdkafka's [`FutureProducer`].

use busline_core::broker::{BrokerError, BrokerFuture, BrokerProducer, DeliveryOptions};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// A producer connection to a Kafka-compatible cluster.
///
/// The rdkafka producer is created on [`connect`](BrokerProducer::connect)
/// and flushed and dropped on [`disconnect`](BrokerProducer::disconnect).
pub struct RedpandaProducer {
    config: ClientConfig,
    timeout: Duration,
    producer: Mutex<Option<FutureProducer>>,
}

impl RedpandaProducer {
    pub(crate) const fn new(config: ClientConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            producer: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<FutureProducer> {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BrokerProducer for RedpandaProducer {
    fn connect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let producer: FutureProducer = self.config.create().map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;
            *self.producer.lock().unwrap_or_else(PoisonError::into_inner) = Some(producer);
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
            let Some(producer) = self.current() else {
                return Err(BrokerError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "producer is not connected".to_string(),
                });
            };

            let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
            if let Some(key) = &options.key {
                record = record.key(key.as_str());
            }
            if let Some(partition) = options.partition {
                record = record.partition(partition);
            }
            if !options.headers.is_empty() {
                let headers = options
                    .headers
                    .iter()
                    .fold(OwnedHeaders::new(), |headers, (name, value)| {
                        headers.insert(Header {
                            key: name.as_str(),
                            value: Some(value.as_str()),
                        })
                    });
                record = record.headers(headers);
            }

            match producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        "Message published"
                    );
                    Ok(())
                },
                Err((e, _message)) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to publish message");
                    Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })
                },
            }
        })
    }

    fn disconnect(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let producer = self
                .producer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(producer) = producer else {
                return Ok(());
            };

            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to flush producer: {e}"))
                })
        })
    }
}

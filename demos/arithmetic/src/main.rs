//! Arithmetic Service - Request/Reply Example
//!
//! Registers `math.add` and `math.divide` handlers that reply to every
//! request, then sends itself one request of each kind.
//!
//! # Running the Example
//!
//! ```bash
//! docker run -d -p 9092:9092 redpandadata/redpanda redpanda start --overprovisioned --smp 1
//! BUSLINE_BROKERS=localhost:9092 BUSLINE_GROUP_ID=arithmetic cargo run -p arithmetic
//! ```
//!
//! All `BUSLINE_*` variables understood by `MessagingConfig::from_env` apply.

#![allow(missing_docs)]

use busline_core::broker::{Broker, DeliveryOptions};
use busline_core::config::MessagingConfig;
use busline_core::envelope::EnvelopeBase;
use busline_core::registry::{Delivery, HandlerError, RegistryBuilder, SubscribeOptions, handler_fn};
use busline_redpanda::RedpandaBroker;
use busline_runtime::MessagingClient;
use busline_runtime::metrics::MetricsServer;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

fn operands(delivery: &Delivery<MessagingClient>) -> Result<Operands, HandlerError> {
    let data = delivery.envelope.data().cloned().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| HandlerError::new("InvalidInput", e.to_string()))
}

async fn add(delivery: Delivery<MessagingClient>) -> Result<Value, HandlerError> {
    let Operands { a, b } = operands(&delivery)?;
    let sum = a
        .checked_add(b)
        .ok_or_else(|| HandlerError::new("Overflow", "sum does not fit in i64"))?;
    tracing::info!(a, b, sum, trace_id = delivery.envelope.trace_id(), "add");
    Ok(json!(sum))
}

async fn divide(delivery: Delivery<MessagingClient>) -> Result<Value, HandlerError> {
    let Operands { a, b } = operands(&delivery)?;
    if b == 0 {
        return Err(
            HandlerError::new("DivisionByZero", "cannot divide by zero").with_code("MATH_DIV_ZERO")
        );
    }
    let quotient = a
        .checked_div(b)
        .ok_or_else(|| HandlerError::new("Overflow", "quotient does not fit in i64"))?;
    tracing::info!(a, b, quotient, trace_id = delivery.envelope.trace_id(), "divide");
    Ok(json!(quotient))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,busline_runtime=debug,arithmetic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MessagingConfig::from_env()?;
    tracing::info!(brokers = %config.brokers, group_id = %config.group_id, "Starting arithmetic service");

    let mut metrics = MetricsServer::new(([0, 0, 0, 0], 9000).into());
    metrics.start()?;

    let mut registry = RegistryBuilder::new();
    registry
        .register(
            "math.add",
            handler_fn(add),
            SubscribeOptions::default().expects_reply(true),
        )?
        .register(
            "math.divide",
            handler_fn(divide),
            SubscribeOptions::default().expects_reply(true),
        )?;

    let broker = Arc::new(RedpandaBroker::from_config(&config)?);
    for topic in ["math.add", "math.divide"] {
        broker.create_topic(topic).await?;
    }

    let client = MessagingClient::builder(broker)
        .config(config)
        .registry(registry.freeze())
        .build();
    client.connect().await?;
    tracing::info!("✓ Client connected");

    if let Some(mut failures) = client.take_failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                tracing::warn!(topic = %failure.topic, error = %failure.error, "Handler failed");
            }
        });
    }

    // Give the group a moment to settle before calling ourselves.
    tokio::time::sleep(Duration::from_secs(3)).await;

    match client.request::<_, i64>("math.add", json!({"a": 2, "b": 3})).await {
        Ok(sum) => tracing::info!(sum, "✓ math.add replied"),
        Err(e) => tracing::error!(error = %e, "math.add request failed"),
    }

    let divided = client
        .request_reply(
            EnvelopeBase::new("math.divide").with_data(json!({"a": 1, "b": 0})),
            &DeliveryOptions::default(),
            Duration::from_secs(10),
        )
        .await;
    match divided {
        Ok(reply) => tracing::info!(data = ?reply.data(), "math.divide replied"),
        Err(e) => tracing::info!(error = %e, "✓ math.divide rejected division by zero"),
    }

    let health = client.health_check().await;
    if health.status.is_healthy() {
        tracing::info!(metadata = ?health.metadata, "✓ Client is healthy");
    } else {
        tracing::warn!(reason = ?health.message, metadata = ?health.metadata, "Client is unhealthy");
    }

    tracing::info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");

    client.shutdown().await?;
    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }
    tracing::info!("✓ Clean shutdown complete");

    Ok(())
}

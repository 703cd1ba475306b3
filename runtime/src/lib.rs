//! # Busline Runtime
//!
//! The messaging client for Busline.
//!
//! [`MessagingClient`] ties the pieces of `busline-core` together over any
//! [`Broker`](busline_core::broker::Broker):
//!
//! - **Dispatch**: one background loop routes inbound envelopes to the
//!   handlers of a frozen [`SubscriptionRegistry`](busline_core::registry::SubscriptionRegistry)
//!   and publishes replies for subscriptions that expect one
//! - **Publish**: [`send`](MessagingClient::send) (fire-and-forget)
//! - **Request/Reply**: [`request_reply`](MessagingClient::request_reply)
//!   over an ephemeral, per-call reply topic
//! - **Liveness**: [`is_healthy`](MessagingClient::is_healthy) from consumer
//!   heartbeats and consumer-group state
//!
//! ## Example
//!
//! ```ignore
//! use busline_core::registry::{handler_fn, RegistryBuilder, SubscribeOptions};
//! use busline_runtime::MessagingClient;
//!
//! let mut registry = RegistryBuilder::<MessagingClient>::new();
//! registry.register(
//!     "math.add",
//!     handler_fn(|delivery| async move { Ok(json!(3)) }),
//!     SubscribeOptions::default().expects_reply(true),
//! )?;
//!
//! let client = MessagingClient::builder(broker)
//!     .registry(registry.freeze())
//!     .build();
//! client.connect().await?;
//! ```

/// The messaging client (lifecycle, publish, request/reply, health)
pub mod client;

/// Inbound message dispatch
pub mod dispatch;

/// Health check types
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

pub use client::{ClientState, DispatchFailure, MessagingClient, MessagingClientBuilder};
pub use dispatch::Dispatched;
pub use health::{HealthCheck, HealthStatus};

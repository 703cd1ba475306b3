//! # Busline Core
//!
//! Core types for the Busline messaging layer.
//!
//! Busline sits on top of a topic-partitioned publish/subscribe broker
//! (anything speaking the Kafka protocol) and adds:
//!
//! - A standardized [`Envelope`](envelope::Envelope) carrying tracing metadata
//! - A [`SubscriptionRegistry`](registry::SubscriptionRegistry) mapping topics to handlers
//! - A dyn-compatible [`Broker`](broker::Broker) boundary so transports are swappable
//! - A [`LivenessMonitor`](liveness::LivenessMonitor) that tolerates consumer-group rebalances
//!
//! The messaging client that ties these together lives in `busline-runtime`.
//!
//! ## Example
//!
//! ```
//! use busline_core::envelope::{create_envelope, EnvelopeBase, EnvelopeOptions};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), busline_core::error::MessagingError> {
//! let envelope = create_envelope(
//!     EnvelopeBase::new("orders.place").with_data(json!({ "sku": "A-1" })),
//!     EnvelopeOptions::client_request(),
//! )?;
//!
//! assert_eq!(
//!     envelope.response_to(),
//!     format!("orders.place.response.{}", envelope.trace_id())
//! );
//! # Ok(())
//! # }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Broker transport boundary (admin, consumer and producer roles)
pub mod broker;

/// Messaging configuration loaded from code or environment
pub mod config;

/// The wire envelope and its construction rules
pub mod envelope;

/// Error types shared by every Busline crate
pub mod error;

/// Heartbeat tracking and the liveness verdict
pub mod liveness;

/// Topic to handler subscription table
pub mod registry;

/// Environment module - Dependency injection traits
///
/// External inputs that make behaviour non-deterministic (currently only
/// time) are abstracted behind traits so tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use busline_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// assert!(clock.now_millis() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Current time as epoch milliseconds (UTC)
        fn now_millis(&self) -> i64 {
            self.now().timestamp_millis()
        }
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use broker::{Broker, BrokerConsumer, BrokerError, BrokerProducer, DeliveryOptions, GroupState};
pub use envelope::{Envelope, EnvelopeBase, EnvelopeOptions, SerializedError};
pub use error::MessagingError;
pub use registry::{Delivery, HandlerError, RegistryBuilder, SubscribeOptions, SubscriptionRegistry};

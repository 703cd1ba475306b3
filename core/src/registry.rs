//! Topic to handler subscription table.
//!
//! The registry is filled once, during startup, and then frozen:
//!
//! ```text
//! RegistryBuilder::register(..)  ─┐
//! RegistryBuilder::register(..)   ├─►  freeze()  ─►  SubscriptionRegistry (read-only, Arc-shared)
//! RegistryBuilder::register(..)  ─┘
//! ```
//!
//! Handlers are plain values: a closure plus whatever state it captured. The
//! registry does not know about the component that declared the handler, so
//! there is no lifetime coupling between the (process-wide) table and the
//! (scoped) owners of handler state.
//!
//! # Duplicate registrations
//!
//! Registering a topic that is already present replaces the earlier entry
//! (last registration wins). The replacement is logged at `warn` so
//! accidental duplicates show up in the startup logs.
//!
//! # Example
//!
//! ```
//! use busline_core::registry::{handler_fn, RegistryBuilder, SubscribeOptions};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), busline_core::error::MessagingError> {
//! let mut builder = RegistryBuilder::<()>::new();
//! builder.register(
//!     "math.add",
//!     handler_fn(|delivery| async move {
//!         let data = delivery.envelope.data().cloned().unwrap_or_default();
//!         let sum = data["a"].as_i64().unwrap_or(0) + data["b"].as_i64().unwrap_or(0);
//!         Ok(json!(sum))
//!     }),
//!     SubscribeOptions::default().expects_reply(true),
//! )?;
//!
//! let registry = builder.freeze();
//! assert!(registry.resolve("math.add").is_some_and(|entry| entry.options.expects_reply));
//! # Ok(())
//! # }
//! ```

use crate::envelope::{Envelope, SerializedError};
use crate::error::MessagingError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a handler receives: the client handle and the decoded envelope.
#[derive(Clone, Debug)]
pub struct Delivery<C> {
    /// Handle to the messaging client (for publishing follow-up messages)
    pub client: C,
    /// The decoded inbound envelope
    pub envelope: Envelope<Value>,
}

/// Failure raised by a handler.
///
/// Serialized into the `error` field of the reply when the subscription
/// expects one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerError {
    /// Error kind
    pub name: String,
    /// Human-readable message
    pub message: String,
    /// Optional machine-readable code
    pub code: Option<String>,
}

impl HandlerError {
    /// Create a handler error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
        }
    }

    /// Attach a machine-readable code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Wrap any error under the given kind.
    #[must_use]
    pub fn from_error(name: impl Into<String>, error: &dyn std::error::Error) -> Self {
        Self::new(name, error.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for SerializedError {
    fn from(error: HandlerError) -> Self {
        Self {
            name: error.name,
            message: error.message,
            code: error.code,
            details: None,
        }
    }
}

impl From<MessagingError> for HandlerError {
    fn from(error: MessagingError) -> Self {
        match error {
            MessagingError::Remote(remote) => Self {
                name: remote.name,
                message: remote.message,
                code: remote.code,
            },
            other => Self::new("MessagingError", other.to_string()),
        }
    }
}

/// Future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// A registered handler: a callable value invoked once per inbound message.
pub type Handler<C> = Arc<dyn Fn(Delivery<C>) -> HandlerFuture + Send + Sync>;

/// Turn an async closure into a [`Handler`].
pub fn handler_fn<C, F, Fut>(f: F) -> Handler<C>
where
    C: 'static,
    F: Fn(Delivery<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |delivery| Box::pin(f(delivery)) as HandlerFuture)
}

/// Options given at registration time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Read from the earliest offset when the group has no committed offset
    pub from_beginning: bool,
    /// Publish the handler's outcome to the envelope's `responseTo` topic
    pub expects_reply: bool,
}

impl SubscribeOptions {
    /// Set `from_beginning`.
    #[must_use]
    pub const fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    /// Set `expects_reply`.
    #[must_use]
    pub const fn expects_reply(mut self, expects_reply: bool) -> Self {
        self.expects_reply = expects_reply;
        self
    }
}

/// One row of the registry.
pub struct SubscriptionEntry<C> {
    /// The handler to invoke
    pub handler: Handler<C>,
    /// Registration options
    pub options: SubscribeOptions,
}

impl<C> Clone for SubscriptionEntry<C> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            options: self.options,
        }
    }
}

impl<C> fmt::Debug for SubscriptionEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("handler", &"<handler>")
            .field("options", &self.options)
            .finish()
    }
}

/// Mutable registration phase of the registry.
pub struct RegistryBuilder<C> {
    entries: HashMap<String, SubscriptionEntry<C>>,
    order: Vec<String>,
}

impl<C> Default for RegistryBuilder<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<C> RegistryBuilder<C> {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`.
    ///
    /// Re-registering a topic replaces its entry (last registration wins)
    /// and keeps the topic's original position in [`SubscriptionRegistry::all_topics`].
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Validation`] if `topic` is empty.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        handler: Handler<C>,
        options: SubscribeOptions,
    ) -> Result<&mut Self, MessagingError> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(MessagingError::Validation(
                "subscription topic must not be empty".to_string(),
            ));
        }

        let entry = SubscriptionEntry { handler, options };
        if self.entries.insert(topic.clone(), entry).is_some() {
            tracing::warn!(
                topic = %topic,
                "Topic registered more than once, last registration wins"
            );
        } else {
            self.order.push(topic);
        }
        Ok(self)
    }

    /// Number of registered topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End the registration phase.
    #[must_use]
    pub fn freeze(self) -> SubscriptionRegistry<C> {
        SubscriptionRegistry {
            inner: Arc::new(Frozen {
                entries: self.entries,
                order: self.order,
            }),
        }
    }
}

struct Frozen<C> {
    entries: HashMap<String, SubscriptionEntry<C>>,
    order: Vec<String>,
}

/// Read-only subscription table shared by the messaging client.
///
/// Cloning is cheap and every clone observes the same table.
pub struct SubscriptionRegistry<C> {
    inner: Arc<Frozen<C>>,
}

impl<C> Clone for SubscriptionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Default for SubscriptionRegistry<C> {
    fn default() -> Self {
        RegistryBuilder::new().freeze()
    }
}

impl<C> SubscriptionRegistry<C> {
    /// Look up the entry for `topic`.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Option<&SubscriptionEntry<C>> {
        self.inner.entries.get(topic)
    }

    /// Every registered topic, in first-registration order.
    pub fn all_topics(&self) -> impl Iterator<Item = &str> {
        self.inner.order.iter().map(String::as_str)
    }

    /// Topics paired with their entries, in first-registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SubscriptionEntry<C>)> {
        self.inner
            .order
            .iter()
            .filter_map(|topic| self.inner.entries.get(topic).map(|e| (topic.as_str(), e)))
    }

    /// Number of registered topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl<C> fmt::Debug for SubscriptionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.inner.order)
            .finish()
    }
}

//! The standardized message envelope.
//!
//! Every message Busline puts on the broker is an [`Envelope`]: the
//! application payload plus correlation and tracing metadata. Envelopes are
//! encoded as UTF-8 JSON with camelCase field names:
//!
//! ```json
//! {
//!   "topic": "math.add",
//!   "data": { "a": 1, "b": 2 },
//!   "error": null,
//!   "traceId": "0b6c7c1e-...",
//!   "requestId": "5f1d2a9e-...",
//!   "responseTo": "math.add.response.0b6c7c1e-...",
//!   "timestamp": 1735689600000,
//!   "dateTime": "2025-01-01T00:00:00.000Z"
//! }
//! ```
//!
//! # Invariants
//!
//! - `traceId` is minted once, at creation, and never changes
//! - `responseTo` is always `<topic>.response.<traceId>`
//! - A reply carries exactly one of `data` / `error`
//! - Absent `data` is left out of the JSON; `"data": null` is a present
//!   `null` payload
//!
//! Fields are private and exposed through accessors so these invariants
//! cannot be broken after construction.

use crate::environment::{Clock, SystemClock};
use crate::error::MessagingError;
use chrono::SecondsFormat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;
use uuid::Uuid;

/// Separator between the request topic and the trace id in reply topic names.
pub const RESPONSE_INFIX: &str = ".response.";

/// Transport form of a failure.
///
/// Carried in the `error` field of a reply envelope and raised on the
/// requester side as [`MessagingError::Remote`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Error kind (e.g. `"DivisionByZero"`)
    pub name: String,

    /// Human-readable message
    pub message: String,

    /// Optional machine-readable code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Optional structured details (the `source()` chain for wrapped errors)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SerializedError {
    /// Create a serialized error from a kind and message.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Attach a machine-readable code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Capture any error, recording its `source()` chain under `details.causes`.
    #[must_use]
    pub fn from_error(name: impl Into<String>, error: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(Value::String(cause.to_string()));
            source = cause.source();
        }

        let serialized = Self::new(name, error.to_string());
        if causes.is_empty() {
            serialized
        } else {
            serialized.with_details(serde_json::json!({ "causes": causes }))
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

impl StdError for SerializedError {}

/// Caller-supplied part of an envelope.
///
/// `data` and `error` are both optional; an envelope with neither is a pure
/// control message.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvelopeBase<T = Value> {
    /// Destination topic (required, non-empty)
    pub topic: String,
    /// Application payload
    pub data: Option<T>,
    /// Failure being reported
    pub error: Option<SerializedError>,
}

impl<T> EnvelopeBase<T> {
    /// Start a base for the given topic with no payload.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: None,
            error: None,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the error.
    #[must_use]
    pub fn with_error(mut self, error: SerializedError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Options for envelope creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeOptions {
    /// Marks the envelope as a client-initiated request (mints `requestId`)
    pub is_client_request: bool,
}

impl EnvelopeOptions {
    /// Options for a client-initiated request.
    #[must_use]
    pub const fn client_request() -> Self {
        Self {
            is_client_request: true,
        }
    }
}

/// The message on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T = Value> {
    topic: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_data",
        bound(deserialize = "T: Deserialize<'de>")
    )]
    data: Option<T>,
    error: Option<SerializedError>,
    trace_id: String,
    request_id: Option<String>,
    response_to: String,
    timestamp: i64,
    date_time: String,
}

impl<T> Envelope<T> {
    /// Destination topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Application payload.
    #[must_use]
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Reported failure.
    #[must_use]
    pub const fn error(&self) -> Option<&SerializedError> {
        self.error.as_ref()
    }

    /// Globally unique id minted at creation.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Request id, present only on client-initiated requests.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Topic a reply to this envelope must be published to.
    #[must_use]
    pub fn response_to(&self) -> &str {
        &self.response_to
    }

    /// Creation instant, epoch milliseconds (UTC).
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Creation instant, ISO-8601 UTC.
    #[must_use]
    pub fn date_time(&self) -> &str {
        &self.date_time
    }

    /// Re-check the construction rules (non-empty topic, not both `data` and `error`).
    ///
    /// Envelopes built here always pass; decoded ones may not.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Validation`] if a rule is violated.
    pub fn validate(&self) -> Result<(), MessagingError> {
        validate_fields(&self.topic, self.data.is_some(), self.error.is_some())
    }

    /// Take the payload out of the envelope.
    #[must_use]
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Convert the payload, keeping every metadata field untouched.
    ///
    /// # Errors
    ///
    /// Returns whatever error `f` returns.
    pub fn try_map_data<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<Envelope<U>, E> {
        let data = self.data.map(f).transpose()?;
        Ok(Envelope {
            topic: self.topic,
            data,
            error: self.error,
            trace_id: self.trace_id,
            request_id: self.request_id,
            response_to: self.response_to,
            timestamp: self.timestamp,
            date_time: self.date_time,
        })
    }

    /// Build the reply to this envelope.
    ///
    /// The reply is addressed to [`response_to`](Self::response_to) and
    /// carries either the handler's value or its failure, never both.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Validation`] if this envelope has an empty
    /// `responseTo` (only possible for envelopes decoded from foreign producers).
    pub fn reply<R>(
        &self,
        outcome: Result<R, SerializedError>,
        clock: &dyn Clock,
    ) -> Result<Envelope<R>, MessagingError> {
        let base = EnvelopeBase::new(self.response_to.clone());
        let base = match outcome {
            Ok(data) => base.with_data(data),
            Err(error) => base.with_error(error),
        };
        create_envelope_at(base, EnvelopeOptions::default(), clock)
    }
}

impl Envelope<Value> {
    /// Deserialize the JSON payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Decode`] if the payload does not match `T`.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Envelope<T>, MessagingError> {
        self.try_map_data(|value| {
            serde_json::from_value(value).map_err(|e| MessagingError::Decode(e.to_string()))
        })
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize the payload into JSON, keeping every metadata field untouched.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Serialization`] if the payload cannot be serialized.
    pub fn into_json(self) -> Result<Envelope<Value>, MessagingError> {
        self.try_map_data(|data| {
            serde_json::to_value(data).map_err(|e| MessagingError::Serialization(e.to_string()))
        })
    }
}

/// A `data` field that is on the wire is a payload, even when it is `null`.
///
/// Absent data is omitted on encode, so only a payload type that cannot hold
/// `null` decodes an explicit `null` as absent.
fn present_data<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(T::deserialize(Value::Null).ok());
    }
    T::deserialize(value).map(Some).map_err(serde::de::Error::custom)
}

/// Compute the reply topic name for a request topic and trace id.
#[must_use]
pub fn response_topic(topic: &str, trace_id: &str) -> String {
    format!("{topic}{RESPONSE_INFIX}{trace_id}")
}

/// Validate the caller-supplied part of an envelope.
///
/// # Errors
///
/// Returns [`MessagingError::Validation`] if the topic is empty or both
/// `data` and `error` are populated.
pub fn validate_base<T>(base: &EnvelopeBase<T>) -> Result<(), MessagingError> {
    validate_fields(&base.topic, base.data.is_some(), base.error.is_some())
}

fn validate_fields(topic: &str, has_data: bool, has_error: bool) -> Result<(), MessagingError> {
    if topic.trim().is_empty() {
        return Err(MessagingError::Validation(
            "topic must not be empty".to_string(),
        ));
    }
    if has_data && has_error {
        return Err(MessagingError::Validation(format!(
            "envelope for topic '{topic}' populates both data and error"
        )));
    }
    Ok(())
}

/// Create a standardized envelope using the system clock.
///
/// # Errors
///
/// Returns [`MessagingError::Validation`] if the base is invalid
/// (see [`validate_base`]).
///
/// # Examples
///
/// ```
/// use busline_core::envelope::{create_envelope, EnvelopeBase, EnvelopeOptions};
///
/// let event = create_envelope(EnvelopeBase::<()>::new("audit.login"), EnvelopeOptions::default())?;
/// assert!(event.request_id().is_none());
/// assert!(event.date_time().ends_with('Z'));
/// # Ok::<(), busline_core::error::MessagingError>(())
/// ```
pub fn create_envelope<T>(
    base: EnvelopeBase<T>,
    options: EnvelopeOptions,
) -> Result<Envelope<T>, MessagingError> {
    create_envelope_at(base, options, &SystemClock)
}

/// Create a standardized envelope, stamping time from `clock`.
///
/// # Errors
///
/// Returns [`MessagingError::Validation`] if the base is invalid.
pub fn create_envelope_at<T>(
    base: EnvelopeBase<T>,
    options: EnvelopeOptions,
    clock: &dyn Clock,
) -> Result<Envelope<T>, MessagingError> {
    validate_base(&base)?;

    let trace_id = Uuid::new_v4().to_string();
    let request_id = options
        .is_client_request
        .then(|| Uuid::new_v4().to_string());
    let now = clock.now();

    Ok(Envelope {
        response_to: response_topic(&base.topic, &trace_id),
        topic: base.topic,
        data: base.data,
        error: base.error,
        trace_id,
        request_id,
        timestamp: now.timestamp_millis(),
        date_time: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Create several envelopes sharing the same options.
///
/// # Errors
///
/// Returns the first validation error; no envelope is returned in that case.
pub fn create_envelopes<T>(
    bases: impl IntoIterator<Item = EnvelopeBase<T>>,
    options: EnvelopeOptions,
    clock: &dyn Clock,
) -> Result<Vec<Envelope<T>>, MessagingError> {
    bases
        .into_iter()
        .map(|base| create_envelope_at(base, options, clock))
        .collect()
}

/// Encode an envelope as UTF-8 JSON.
///
/// # Errors
///
/// Returns [`MessagingError::Serialization`] if the payload cannot be serialized.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<Vec<u8>, MessagingError> {
    serde_json::to_vec(envelope).map_err(|e| MessagingError::Serialization(e.to_string()))
}

/// Decode an envelope from UTF-8 JSON.
///
/// # Errors
///
/// Returns [`MessagingError::Decode`] for malformed bytes, missing required
/// fields or an empty topic.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, MessagingError> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| MessagingError::Decode(e.to_string()))?;
    if envelope.topic.trim().is_empty() {
        return Err(MessagingError::Decode("envelope has an empty topic".to_string()));
    }
    Ok(envelope)
}

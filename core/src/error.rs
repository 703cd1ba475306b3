//! Error types for messaging operations.
//!
//! [`MessagingError`] is the single error surfaced by envelope construction,
//! publishing, request/reply and the dispatch loop. Transport-level failures
//! are reported by the broker as [`BrokerError`] and wrapped here.
//!
//! # Request/Reply failures
//!
//! A request/reply call has a *primary* outcome (the reply, a timeout or a
//! remote error) and a cleanup step that always runs afterwards. When cleanup
//! fails, the call returns [`MessagingError::Cleanup`], which carries the
//! primary outcome next to every cleanup failure so neither is lost.

use crate::broker::BrokerError;
use crate::envelope::{Envelope, SerializedError};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during messaging operations.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Failed to establish (or tear down) a broker connection.
    ///
    /// Fatal at startup; the client does not retry internally.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// An outbound envelope was malformed and was never sent.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The request/reply deadline elapsed before a reply arrived.
    #[error("Unable to reach topic<{topic}>.")]
    Timeout {
        /// The original request topic
        topic: String,
    },

    /// The counterpart answered with a populated `error` field.
    #[error("Remote error: {0}")]
    Remote(SerializedError),

    /// Inbound bytes could not be decoded into an envelope.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Outbound payload could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A subscription handler failed while processing an inbound message.
    ///
    /// Returned by the dispatch step *after* the reply (if any) was published.
    #[error("Handler for topic '{topic}' failed: {error}")]
    HandlerFailed {
        /// Topic the failing handler is registered for
        topic: String,
        /// The handler failure as sent on the wire
        error: SerializedError,
    },

    /// Operation called in a lifecycle state that does not allow it.
    #[error("Invalid client state: expected {expected}, found {actual}")]
    InvalidState {
        /// State required by the operation
        expected: String,
        /// State the client was in
        actual: String,
    },

    /// Releasing per-call resources failed.
    ///
    /// `outcome` is the primary result of the call, reported alongside the
    /// cleanup failures rather than replaced by them.
    #[error("Cleanup failed for topic '{topic}' ({} failure(s)); primary outcome: {}", failures.len(), PrimaryOutcome(outcome))]
    Cleanup {
        /// The topic the call was addressed to
        topic: String,
        /// Primary result of the call
        outcome: Box<Result<Envelope, MessagingError>>,
        /// Every cleanup step that failed
        failures: Vec<CleanupFailure>,
    },
}

impl MessagingError {
    /// Whether this error is (or wraps, via cleanup) a request timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Cleanup { outcome, .. } => {
                matches!(outcome.as_ref(), Err(e) if e.is_timeout())
            },
            _ => false,
        }
    }

    /// Split a cleanup error into its primary outcome, leaving other errors as they are.
    ///
    /// Useful for callers that want the reply even though cleanup failed.
    ///
    /// # Errors
    ///
    /// Returns the primary error, or `self` when it is not a cleanup error.
    pub fn into_primary(self) -> Result<Envelope, Self> {
        match self {
            Self::Cleanup { outcome, .. } => *outcome,
            other => Err(other),
        }
    }
}

/// One failed cleanup step of a request/reply call or a publish.
#[derive(Error, Debug, Clone)]
pub enum CleanupFailure {
    /// The scoped consumer could not be disconnected.
    #[error("failed to disconnect consumer '{group_id}': {source}")]
    Disconnect {
        /// Consumer group of the scoped consumer
        group_id: String,
        /// Underlying broker error
        source: BrokerError,
    },

    /// The ephemeral reply topic could not be deleted.
    #[error("failed to delete topic '{topic}': {source}")]
    DeleteTopic {
        /// The reply topic
        topic: String,
        /// Underlying broker error
        source: BrokerError,
    },

    /// The per-call producer could not be disconnected.
    #[error("failed to disconnect producer: {source}")]
    Producer {
        /// Underlying broker error
        source: BrokerError,
    },
}

struct PrimaryOutcome<'a>(&'a Result<Envelope, MessagingError>);

impl fmt::Display for PrimaryOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Ok(envelope) => write!(f, "reply on '{}'", envelope.topic()),
            Err(e) => write!(f, "{e}"),
        }
    }
}

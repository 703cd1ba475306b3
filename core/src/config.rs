//! Messaging configuration.
//!
//! Configuration can be built in code (starting from [`MessagingConfig::default`])
//! or loaded from environment variables with [`MessagingConfig::from_env`]:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `BUSLINE_BROKERS` | `brokers` | `localhost:9092` |
//! | `BUSLINE_CLIENT_ID` | `client_id` | `busline` |
//! | `BUSLINE_GROUP_ID` | `group_id` | `busline-consumer` |
//! | `BUSLINE_TIMEOUT_MS` | `request_timeout` | `30000` |
//! | `BUSLINE_SESSION_TIMEOUT_MS` | `session_timeout` | `6000` |
//! | `BUSLINE_AUTO_OFFSET_RESET` | `auto_offset_reset` | `latest` |
//!
//! # Example
//!
//! ```no_run
//! use busline_core::config::MessagingConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MessagingConfig::from_env()?;
//! println!("Brokers: {}", config.brokers);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default request/reply timeout and heartbeat staleness bound.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse an environment variable
    #[error("Failed to parse {var}: {reason}")]
    ParseError {
        /// Variable name
        var: String,
        /// Why parsing failed
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the earliest retained offset
    Earliest,
    /// Only new messages
    Latest,
}

impl OffsetReset {
    /// Parse `earliest` / `latest` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for any other value.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "earliest" | "beginning" => Ok(Self::Earliest),
            "latest" | "end" => Ok(Self::Latest),
            other => Err(ConfigError::ValidationError(format!(
                "unknown auto offset reset policy: {other}"
            ))),
        }
    }

    /// Value understood by Kafka clients (`auto.offset.reset`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Messaging client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Consumer group of the dispatch consumer
    pub group_id: String,
    /// Request/reply deadline and heartbeat staleness bound
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Consumer session timeout
    #[serde(with = "millis")]
    pub session_timeout: Duration,
    /// Where the dispatch consumer starts for topics not registered `from_beginning`
    pub auto_offset_reset: OffsetReset,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "busline".to_string(),
            group_id: "busline-consumer".to_string(),
            request_timeout: DEFAULT_TIMEOUT,
            session_timeout: Duration::from_millis(6_000),
            auto_offset_reset: OffsetReset::Latest,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from `BUSLINE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(brokers) = lookup("BUSLINE_BROKERS") {
            config.brokers = brokers;
        }
        if let Some(client_id) = lookup("BUSLINE_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(group_id) = lookup("BUSLINE_GROUP_ID") {
            config.group_id = group_id;
        }
        if let Some(raw) = lookup("BUSLINE_TIMEOUT_MS") {
            config.request_timeout = parse_millis("BUSLINE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("BUSLINE_SESSION_TIMEOUT_MS") {
            config.session_timeout = parse_millis("BUSLINE_SESSION_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("BUSLINE_AUTO_OFFSET_RESET") {
            config.auto_offset_reset = OffsetReset::parse(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.split(',').all(|b| b.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "brokers cannot be empty".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "client_id cannot be empty".to_string(),
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "group_id cannot be empty".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout must be > 0".to_string(),
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "session_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(var: &str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::ParseError {
            var: var.to_string(),
            reason: e.to_string(),
        })
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = MessagingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = MessagingConfig::from_lookup(lookup(&[
            ("BUSLINE_BROKERS", "kafka-1:9092,kafka-2:9092"),
            ("BUSLINE_GROUP_ID", "billing"),
            ("BUSLINE_TIMEOUT_MS", "1500"),
            ("BUSLINE_AUTO_OFFSET_RESET", "Earliest"),
        ]))
        .unwrap();

        assert_eq!(config.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.group_id, "billing");
        assert_eq!(config.client_id, "busline");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.auto_offset_reset, OffsetReset::Earliest);
    }

    #[test]
    fn rejects_unparseable_timeout() {
        let err = MessagingConfig::from_lookup(lookup(&[("BUSLINE_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref var, .. } if var == "BUSLINE_TIMEOUT_MS"));
    }

    #[test]
    fn rejects_zero_timeout_and_empty_brokers() {
        assert!(MessagingConfig::from_lookup(lookup(&[("BUSLINE_TIMEOUT_MS", "0")])).is_err());
        assert!(MessagingConfig::from_lookup(lookup(&[("BUSLINE_BROKERS", " , ")])).is_err());
    }

    #[test]
    fn serializes_durations_as_millis() {
        let json = serde_json::to_value(MessagingConfig::default()).unwrap();
        assert_eq!(json["request_timeout"], 30_000);
        assert_eq!(json["auto_offset_reset"], "latest");
    }
}

//! The shape [`MessagingClient::health_check`](crate::MessagingClient::health_check)
//! reports in.

use std::fmt;

/// Liveness verdict of the messaging client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connected, and the consumer is heartbeating or rebalancing
    Healthy,
    /// Not running, or the consumer heartbeat went stale outside a rebalance
    Unhealthy,
}

impl HealthStatus {
    /// Whether the status is [`Healthy`](Self::Healthy).
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// One health check result.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Checked component (`"messaging"` for the client)
    pub component: String,
    /// Verdict
    pub status: HealthStatus,
    /// Why the component is unhealthy
    pub message: Option<String>,
    /// Client state, consumer group and last heartbeat
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    pub(crate) fn healthy(component: &str) -> Self {
        Self {
            component: component.to_string(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    pub(crate) fn unhealthy(component: &str, message: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    pub(crate) fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.push((key.to_string(), value.into()));
        self
    }

    /// Look up a metadata value.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }
}

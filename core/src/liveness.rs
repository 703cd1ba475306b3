//! Liveness detection from consumer heartbeats.
//!
//! A consumer that is healthy heartbeats regularly. During a consumer-group
//! rebalance, however, members legitimately stop heartbeating until the new
//! assignment is in place, so plain staleness would report routine scaling
//! events as failures. The verdict is therefore:
//!
//! 1. Heartbeat younger than the timeout → healthy (no network call)
//! 2. Otherwise ask the coordinator for the group state → healthy only while
//!    `PreparingRebalance` or `CompletingRebalance`
//! 3. Any other state, or a failed query → unhealthy

use crate::broker::{BrokerError, GroupState};
use crate::environment::Clock;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Records the most recent heartbeat instant.
///
/// Cheap to share: clones observe the same value.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatTracker {
    last_millis: Arc<AtomicI64>,
}

impl HeartbeatTracker {
    /// Create a tracker that has never seen a heartbeat.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat.
    pub fn record(&self, at: DateTime<Utc>) {
        self.record_millis(at.timestamp_millis());
    }

    /// Record a heartbeat given as epoch milliseconds.
    ///
    /// Out-of-order observations never move the value backwards.
    pub fn record_millis(&self, millis: i64) {
        self.last_millis.fetch_max(millis, Ordering::AcqRel);
    }

    /// Last heartbeat as epoch milliseconds, `None` if none was seen yet.
    #[must_use]
    pub fn last_millis(&self) -> Option<i64> {
        match self.last_millis.load(Ordering::Acquire) {
            0 => None,
            millis => Some(millis),
        }
    }
}

/// Derives a healthy/unhealthy verdict from heartbeat recency and group state.
#[derive(Clone)]
pub struct LivenessMonitor {
    heartbeats: HeartbeatTracker,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LivenessMonitor {
    /// Create a monitor over `heartbeats`, treating heartbeats older than
    /// `timeout` as stale.
    #[must_use]
    pub fn new(heartbeats: HeartbeatTracker, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            heartbeats,
            timeout,
            clock,
        }
    }

    /// The tracker this monitor reads.
    #[must_use]
    pub const fn heartbeats(&self) -> &HeartbeatTracker {
        &self.heartbeats
    }

    /// Whether the last heartbeat is younger than the timeout.
    #[must_use]
    pub fn has_fresh_heartbeat(&self) -> bool {
        let Some(last) = self.heartbeats.last_millis() else {
            return false;
        };
        let timeout_ms = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_sub(last) < timeout_ms
    }

    /// Compute the liveness verdict.
    ///
    /// `describe_group` is only awaited when the heartbeat is stale, and at
    /// most once.
    pub async fn is_healthy<F, Fut>(&self, describe_group: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GroupState, BrokerError>>,
    {
        if self.has_fresh_heartbeat() {
            return true;
        }

        match describe_group().await {
            Ok(state) => {
                let rebalancing = state.is_rebalancing();
                tracing::debug!(
                    group_state = %state,
                    last_heartbeat_ms = ?self.heartbeats.last_millis(),
                    healthy = rebalancing,
                    "Heartbeat stale, consulted consumer group state"
                );
                rebalancing
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to describe consumer group");
                false
            },
        }
    }
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("heartbeats", &self.heartbeats)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

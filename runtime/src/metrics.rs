//! Prometheus metrics for the messaging client.
//!
//! The client records through the `metrics` facade; nothing is exported
//! unless a recorder is installed. [`MetricsServer`] installs the Prometheus
//! recorder and renders the exposition text:
//!
//! - `busline_messages_published_total`
//! - `busline_messages_dispatched_total`
//! - `busline_dispatch_failures_total`
//! - `busline_request_reply_duration_seconds`
//! - `busline_request_reply_timeouts_total`
//!
//! # Example
//!
//! ```rust,no_run
//! use busline_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// `addr` is the address the scrape endpoint is announced on.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "busline_messages_published_total",
        "Total number of envelopes published"
    );
    describe_counter!(
        "busline_messages_dispatched_total",
        "Total number of inbound envelopes handed to a handler"
    );
    describe_counter!(
        "busline_dispatch_failures_total",
        "Total number of handler or reply failures in the dispatch loop"
    );
    describe_histogram!(
        "busline_request_reply_duration_seconds",
        "Time from request creation to reply (or timeout), including cleanup"
    );
    describe_counter!(
        "busline_request_reply_timeouts_total",
        "Total number of request/reply calls that timed out"
    );
}

/// Messaging metrics recorder.
pub struct MessagingMetrics;

impl MessagingMetrics {
    /// Record a published envelope.
    pub fn record_publish() {
        counter!("busline_messages_published_total").increment(1);
    }

    /// Record an envelope handed to a handler.
    pub fn record_dispatch() {
        counter!("busline_messages_dispatched_total").increment(1);
    }

    /// Record a dispatch failure.
    pub fn record_dispatch_failure() {
        counter!("busline_dispatch_failures_total").increment(1);
    }

    /// Record a finished request/reply call.
    pub fn record_request_reply(duration: Duration, timed_out: bool) {
        histogram!("busline_request_reply_duration_seconds").record(duration.as_secs_f64());
        if timed_out {
            counter!("busline_request_reply_timeouts_total").increment(1);
        }
    }
}

//! Prometheus metrics for the request/reply bridge.
//!
//! Metrics are recorded through the `metrics` facade, so recording is a no-op
//! until a recorder is installed. Services install the Prometheus recorder
//! with [`MetricsExporter::install`] and serve [`MetricsExporter::render`]
//! from their `/metrics` route.
//!
//! | Metric | Kind | Labels |
//! |---|---|---|
//! | `courier_connect_attempts_total` | counter | `outcome` |
//! | `courier_events_published_total` | counter | `event_type` |
//! | `courier_publish_retries_total` | counter | |
//! | `courier_waits_total` | counter | `outcome` |
//! | `courier_wait_duration_seconds` | histogram | |
//! | `courier_correlation_mismatches_total` | counter | |
//! | `courier_consumer_events_total` | counter | `outcome` |

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
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

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Describe every Courier metric and install the global Prometheus
    /// recorder.
    ///
    /// If another recorder is already installed (several tests in one
    /// process), the exporter is returned without a handle and
    /// [`render`](Self::render) yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus metrics recorder installed");
                Ok(Self {
                    handle: Some(handle),
                })
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(Self { handle: None })
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// An exporter that records nothing and renders nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { handle: None }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "courier_connect_attempts_total",
        "Broker connection attempts by outcome"
    );
    describe_counter!(
        "courier_events_published_total",
        "Envelopes published to the events exchange"
    );
    describe_counter!(
        "courier_publish_retries_total",
        "Publish attempts beyond the first"
    );
    describe_counter!(
        "courier_waits_total",
        "Reply waits by outcome (matched, timeout, cancelled, error)"
    );
    describe_histogram!(
        "courier_wait_duration_seconds",
        "Time from subscribing to a reply until the wait returned"
    );
    describe_counter!(
        "courier_correlation_mismatches_total",
        "Replies dropped by a waiter because the correlation id did not match"
    );
    describe_counter!(
        "courier_consumer_events_total",
        "Deliveries processed by background consumers by outcome"
    );
}

/// Outcome label of a finished wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A matching reply arrived.
    Matched,
    /// The deadline elapsed.
    Timeout,
    /// The caller cancelled the wait.
    Cancelled,
    /// The subscription failed.
    Error,
}

impl WaitOutcome {
    const fn label(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// Broker link metrics recorder.
pub struct LinkMetrics;

impl LinkMetrics {
    /// Record one connection attempt.
    pub fn record_connect_attempt(succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failure" };
        counter!("courier_connect_attempts_total", "outcome" => outcome).increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record a published envelope.
    pub fn record_published(event_type: &str) {
        counter!("courier_events_published_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a publish attempt beyond the first.
    pub fn record_retry() {
        counter!("courier_publish_retries_total").increment(1);
    }
}

/// Reply waiter metrics recorder.
pub struct WaitMetrics;

impl WaitMetrics {
    /// Record a finished wait.
    pub fn record(outcome: WaitOutcome, duration: Duration) {
        counter!("courier_waits_total", "outcome" => outcome.label()).increment(1);
        histogram!("courier_wait_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a reply dropped for carrying another request's correlation id.
    pub fn record_mismatch() {
        counter!("courier_correlation_mismatches_total").increment(1);
    }
}

/// Background consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a delivery with its outcome (`handled`, `undecodable`,
    /// `unexpected`, `malformed`).
    pub fn record(outcome: &'static str) {
        counter!("courier_consumer_events_total", "outcome" => outcome).increment(1);
    }
}

//! Shared state for the gateway's HTTP handlers.

use axum::extract::FromRef;
use courier_runtime::{BrokerLink, Correlator, MetricsExporter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Application state shared across all HTTP handlers.
///
/// Cloned per request; every field is cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    /// Publishes commands and waits for their correlated replies.
    pub correlator: Correlator,
    /// The broker link behind the correlator, for readiness and shutdown.
    pub link: Arc<BrokerLink>,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Cancelled on shutdown so in-flight waits end promptly.
    pub shutdown: CancellationToken,
    /// Prometheus exporter for `/metrics`.
    pub metrics: MetricsExporter,
}

impl GatewayState {
    /// Build the state around a link, publishing on `exchange`.
    #[must_use]
    pub fn new(
        link: Arc<BrokerLink>,
        exchange: impl Into<String>,
        request_timeout: Duration,
        shutdown: CancellationToken,
        metrics: MetricsExporter,
    ) -> Self {
        Self {
            correlator: Correlator::on_exchange(Arc::clone(&link), exchange),
            link,
            request_timeout,
            shutdown,
            metrics,
        }
    }
}

impl FromRef<GatewayState> for Arc<BrokerLink> {
    fn from_ref(state: &GatewayState) -> Self {
        Arc::clone(&state.link)
    }
}

impl FromRef<GatewayState> for MetricsExporter {
    fn from_ref(state: &GatewayState) -> Self {
        state.metrics.clone()
    }
}

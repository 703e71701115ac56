//! Health check endpoints.
//!
//! `/health` is a liveness probe and never touches the broker. `/ready`
//! reports whether the broker link currently holds an open connection.

use axum::{Json, extract::State, http::StatusCode};
use courier_runtime::BrokerLink;
use serde::Serialize;
use std::sync::Arc;

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
}

/// Simple health check endpoint (for basic liveness).
///
/// ```text
/// GET /health
/// {"status":"ok","version":"0.1.0"}
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Readiness response.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// Whether the service should receive traffic.
    pub ready: bool,
    /// Broker connectivity.
    pub broker: bool,
}

/// Readiness check against the broker link.
///
/// The link connects lazily, so a service that has not yet handled a
/// request reports not ready until its first connect.
///
/// - 200 OK: connected
/// - 503 Service Unavailable: disconnected or closed
pub async fn readiness_check(
    State(link): State<Arc<BrokerLink>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let broker = link.is_connected().await;
    let status = if broker {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: broker,
            broker,
        }),
    )
}

//! Prometheus scrape endpoint.

use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use courier_runtime::MetricsExporter;

/// Render the installed recorder in Prometheus text format.
///
/// Returns 404 when metrics are disabled for this process.
#[allow(clippy::unused_async)]
pub async fn metrics_handler(State(exporter): State<MetricsExporter>) -> Response {
    match exporter.render() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_exporter_is_not_found() {
        let response = metrics_handler(State(MetricsExporter::disabled())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

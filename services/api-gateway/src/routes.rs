//! Router configuration for the gateway.

use crate::state::GatewayState;
use crate::users;
use axum::{
    Router,
    routing::{get, post},
};
use courier_web::correlation_id_layer;
use courier_web::handlers::{health_check, metrics_handler, readiness_check};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// Every route runs inside the correlation-id layer, so each response
/// carries `X-Correlation-ID`.
pub fn build_router(state: GatewayState) -> Router {
    let user_routes = Router::new()
        .route("/register", post(users::register))
        .route("/login", post(users::login))
        .route("/oauth", post(users::oauth))
        .route("/profile/:id", get(users::profile));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api/users", user_routes)
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}

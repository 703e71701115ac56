//! HTTP edge service.
//!
//! Accepts user requests over HTTP, publishes the matching user command on
//! the events exchange, and answers with the correlated reply from the
//! user service. Exposed as a library so the router can be driven in tests
//! against an in-memory broker.

pub mod routes;
pub mod state;
pub mod users;

pub use routes::build_router;
pub use state::GatewayState;

/// Default `RUST_LOG` filter for the gateway binary.
pub const DEFAULT_LOG_FILTER: &str = "api_gateway=info,courier_runtime=info,tower_http=info";

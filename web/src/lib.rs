//! Axum integration for Courier edge services.
//!
//! An edge service turns an HTTP request into a command on the broker, waits
//! for the correlated reply, and turns that reply back into HTTP:
//!
//! ```text
//! HTTP request
//!   └─ correlation_id_layer      mint CorrelationId, open http_request span
//!        └─ handler              Correlator::request_correlated(...)
//!             ├─ Success reply   ApiResponse { meta: success, data }
//!             ├─ Failure reply   ApiResponse { meta: fail, data: null }
//!             └─ RelayError      AppError (504 / 503 / 500)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use courier_web::{AppError, ApiResponse, correlation_id_layer};
//!
//! async fn profile(
//!     State(state): State<GatewayState>,
//!     Extension(id): Extension<CorrelationId>,
//!     Path(user_id): Path<String>,
//! ) -> Result<ApiResponse<Value>, AppError> {
//!     let reply = state.correlator.request_correlated(id, "GetProfile", ...).await?;
//!     ...
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;

pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationIdExt, correlation_id_layer};
pub use response::{ApiResponse, Meta, strip_password};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

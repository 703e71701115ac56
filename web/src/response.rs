//! JSON response envelope.
//!
//! Every edge response, success or failure, has the same shape:
//!
//! ```json
//! {
//!   "meta": { "message": "Login successful", "code": 200, "status": "success" },
//!   "data": { "id": "…", "email": "…" }
//! }
//! ```
//!
//! `status` is `success` for 2xx, `fail` for 4xx and `error` otherwise.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Human-readable message.
    pub message: String,
    /// HTTP status code.
    pub code: u16,
    /// `success`, `fail` or `error`.
    pub status: String,
}

/// The response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Response metadata.
    pub meta: Meta,
    /// Payload, `null` on errors.
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Build an envelope for `status`.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            meta: Meta {
                message: message.into(),
                code: status.as_u16(),
                status: status_text(status).to_string(),
            },
            data,
        }
    }

    /// Status code carried in the metadata.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.meta.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl ApiResponse<Value> {
    /// Envelope without data.
    #[must_use]
    pub fn empty(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, message, None)
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Envelope status word for an HTTP status.
#[must_use]
pub fn status_text(status: StatusCode) -> &'static str {
    if status.is_success() {
        "success"
    } else if status.is_client_error() {
        "fail"
    } else {
        "error"
    }
}

/// Remove every `password` key from a JSON value, at any depth.
#[must_use]
pub fn strip_password(mut value: Value) -> Value {
    fn strip(value: &mut Value) {
        match value {
            Value::Object(map) => {
                map.remove("password");
                map.values_mut().for_each(strip);
            }
            Value::Array(items) => items.iter_mut().for_each(strip),
            _ => {}
        }
    }

    strip(&mut value);
    value
}

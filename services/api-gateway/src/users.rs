//! `/api/users` endpoints.
//!
//! Each handler publishes one user command under the request's correlation
//! id and maps the correlated reply:
//!
//! | Route | Command | Success | Failure reply |
//! |---|---|---|---|
//! | `POST /register` | `UserRegistered` | 201 | 409 |
//! | `POST /login` | `UserLogin` | 200 | 401 |
//! | `POST /oauth` | `UserOauth` | 200 | 400 |
//! | `GET /profile/{id}` | `GetProfile` | 200 | 404 |

use crate::state::GatewayState;
use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use courier_core::user::{GetProfile, LoginUser, OauthUser, RegisterUser, UserCommandType};
use courier_core::{CorrelationId, EventEnvelope};
use courier_web::{ApiResponse, AppError, WebResult, strip_password};
use serde::Serialize;
use serde_json::Value;

/// How a command's reply maps onto HTTP.
struct Route {
    command: UserCommandType,
    success_status: StatusCode,
    success_message: &'static str,
    failure_status: StatusCode,
}

const REGISTER: Route = Route {
    command: UserCommandType::UserRegistered,
    success_status: StatusCode::CREATED,
    success_message: "User registered successfully",
    failure_status: StatusCode::CONFLICT,
};

const LOGIN: Route = Route {
    command: UserCommandType::UserLogin,
    success_status: StatusCode::OK,
    success_message: "Login successful",
    failure_status: StatusCode::UNAUTHORIZED,
};

const OAUTH: Route = Route {
    command: UserCommandType::UserOauth,
    success_status: StatusCode::OK,
    success_message: "OAuth login successful",
    failure_status: StatusCode::BAD_REQUEST,
};

const PROFILE: Route = Route {
    command: UserCommandType::GetProfile,
    success_status: StatusCode::OK,
    success_message: "Profile retrieved successfully",
    failure_status: StatusCode::NOT_FOUND,
};

/// `POST /api/users/register`
///
/// # Errors
///
/// Failure replies and relay errors, mapped as in the module table.
pub async fn register(
    State(state): State<GatewayState>,
    Extension(correlation_id): Extension<CorrelationId>,
    body: Result<Json<RegisterUser>, JsonRejection>,
) -> WebResult<ApiResponse<Value>> {
    let Json(request) = body.map_err(invalid_body)?;
    relay(&state, correlation_id, &REGISTER, &request).await
}

/// `POST /api/users/login`
///
/// # Errors
///
/// Failure replies and relay errors, mapped as in the module table.
pub async fn login(
    State(state): State<GatewayState>,
    Extension(correlation_id): Extension<CorrelationId>,
    body: Result<Json<LoginUser>, JsonRejection>,
) -> WebResult<ApiResponse<Value>> {
    let Json(request) = body.map_err(invalid_body)?;
    relay(&state, correlation_id, &LOGIN, &request).await
}

/// `POST /api/users/oauth`
///
/// # Errors
///
/// Failure replies and relay errors, mapped as in the module table.
pub async fn oauth(
    State(state): State<GatewayState>,
    Extension(correlation_id): Extension<CorrelationId>,
    body: Result<Json<OauthUser>, JsonRejection>,
) -> WebResult<ApiResponse<Value>> {
    let Json(request) = body.map_err(invalid_body)?;
    relay(&state, correlation_id, &OAUTH, &request).await
}

/// `GET /api/users/profile/{id}`
///
/// # Errors
///
/// Failure replies and relay errors, mapped as in the module table.
pub async fn profile(
    State(state): State<GatewayState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> WebResult<ApiResponse<Value>> {
    relay(&state, correlation_id, &PROFILE, &GetProfile { id }).await
}

fn invalid_body(rejection: JsonRejection) -> AppError {
    tracing::debug!(error = %rejection, "Rejected request body");
    AppError::bad_request("Invalid request format")
}

async fn relay<T>(
    state: &GatewayState,
    correlation_id: CorrelationId,
    route: &Route,
    payload: &T,
) -> WebResult<ApiResponse<Value>>
where
    T: Serialize + Sync,
{
    let replies = route.command.reply_types();
    let reply = state
        .correlator
        .request_correlated(
            correlation_id,
            route.command.as_str(),
            &[replies.success, replies.failure],
            payload,
            state.request_timeout,
            &state.shutdown,
        )
        .await?;

    if reply.event_type == replies.success {
        Ok(ApiResponse::new(
            route.success_status,
            route.success_message,
            Some(strip_password(reply.payload)),
        ))
    } else {
        Err(AppError::new(route.failure_status, failure_message(&reply)))
    }
}

/// The `message` of a failure reply, or a generic one if the worker sent none.
fn failure_message(reply: &EventEnvelope) -> String {
    reply
        .payload
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| format!("{} failed", reply.event_type), str::to_string)
}

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Gateway error taxonomy. Every user-facing variant maps deterministically
/// to an HTTP status and a JSON body; persistence I/O never surfaces here on
/// the request path (the device registry logs and swallows it).
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Unknown, inactive, or expired credential.
    #[error("{0}")]
    Unauthorized(String),

    /// IP filter or device-cap rejection.
    #[error("{0}")]
    Forbidden(String),

    /// Tier or global admission limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Device-registration velocity cap.
    #[error("Too many registration attempts")]
    RegistrationThrottled,

    /// Malformed input: missing name, non-UUID browser id, bad TOTP key.
    #[error("{0}")]
    BadRequest(String),

    /// Credential or device id unknown to a management operation.
    #[error("{0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Unauthorized(reason) => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": reason }))).into_response()
            }
            GatewayError::Forbidden(reason) => {
                (StatusCode::FORBIDDEN, Json(json!({ "error": reason }))).into_response()
            }
            GatewayError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Rate limit exceeded",
                    "retryAfter": retry_after_secs,
                })),
            )
                .into_response(),
            GatewayError::RegistrationThrottled => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Too many registration attempts, try again later",
                })),
            )
                .into_response(),
            GatewayError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
            }
            GatewayError::NotFound(reason) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": reason }))).into_response()
            }
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Serialization(_) => {
                tracing::error!(error = %self, "internal gateway error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;

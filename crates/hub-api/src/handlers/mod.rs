//! HTTP request handlers.
//!
//! - `messages` - publishing into the hub
//! - `dead_letters` - inspection of exhausted deliveries
//! - `health` - store connectivity
//!
//! Failures are answered with `{"error": {"code", "message"}}`.

pub mod dead_letters;
pub mod health;
pub mod messages;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub use dead_letters::list_dead_letters;
pub use health::health_check;
pub use messages::publish_message;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let body =
        ErrorResponse { error: ErrorDetail { code: code.to_string(), message: message.into() } };
    (status, Json(body)).into_response()
}

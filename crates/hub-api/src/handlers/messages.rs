//! Publish handler.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hub_delivery::DeliveryError;
use serde::Deserialize;
use tracing::{error, instrument, warn};

use super::error_response;
use crate::AppState;

/// Body of `POST /api/v1/messages`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Declared message type.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Arbitrary JSON payload, `null` when absent.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Accepts a message for fan-out to every subscriber of its type.
///
/// Answers `204 No Content` once the message is on the outbound queue,
/// `422` for a malformed body and `503` while the store is unreachable.
#[instrument(name = "publish_message", skip(state, body))]
pub async fn publish_message(
    State(state): State<AppState>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "rejected malformed publish request");
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_message",
                rejection.body_text(),
            );
        },
    };

    if request.message_type.trim().is_empty() {
        warn!("rejected publish request without message type");
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_message",
            "message type must not be empty",
        );
    }

    match state.hub.publish(request.message_type, request.payload).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err @ DeliveryError::StoreUnavailable { .. }) => {
            error!(error = %err, "failed to enqueue published message");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
        },
        Err(err) => {
            error!(error = %err, "unexpected publish failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
        },
    }
}

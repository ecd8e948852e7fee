//! Dead-letter inspection handler.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{debug, error, instrument};

use super::error_response;
use crate::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Query string of the listing endpoint.
#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    /// Maximum records to return, newest first.
    pub limit: Option<usize>,
}

/// Lists the most recent dead letters of a subscribing service.
///
/// Answers `404` for services that do not subscribe to anything.
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    match state.hub.dead_letters(&service, limit).await {
        Ok(Some(records)) => {
            debug!(count = records.len(), "listed dead letters");
            (StatusCode::OK, Json(records)).into_response()
        },
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "unknown_service",
            format!("service {service} has no subscriptions"),
        ),
        Err(err) => {
            error!(error = %err, "failed to list dead letters");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
        },
    }
}

//! Error types and result handling for hub operations.
//!
//! Splits failures into two families: runtime errors raised by the
//! coordination store (transient, retried by the calling loop) and manifest
//! errors raised while loading service declarations (fatal at startup).

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for coordination store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The coordination store could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Whether the failure is transient and the operation may succeed on the
    /// next loop iteration.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            },
            _ => Self::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised while loading or validating the service manifest.
///
/// There is no safe default for any of these, so the process refuses to
/// start.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A service subscribes to message types but declares no endpoint.
    #[error("service {service} subscribes to {types:?} but has no endpoint")]
    MissingEndpoint {
        /// Name of the offending service
        service: String,
        /// Message types it subscribes to
        types: Vec<String>,
    },

    /// The declared retry schedule cannot be used.
    #[error("service {service} has a malformed retry schedule: {reason}")]
    MalformedRetrySchedule {
        /// Name of the offending service
        service: String,
        /// What is wrong with the schedule
        reason: String,
    },

    /// Declared concurrency is zero, negative or not a number.
    #[error("service {service} declares invalid concurrency {concurrency}")]
    InvalidConcurrency {
        /// Name of the offending service
        service: String,
        /// The rejected value
        concurrency: f64,
    },

    /// The manifest document could not be parsed.
    #[error("manifest could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),

    /// The manifest file could not be read.
    #[error("manifest could not be read: {0}")]
    Io(#[from] std::io::Error),
}

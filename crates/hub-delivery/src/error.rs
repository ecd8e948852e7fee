//! Error types for the delivery pipeline.
//!
//! Delivery failures (network, timeout, non-2xx status) are recovered per
//! message by the scheduler. Store and lifecycle errors surface to the loops
//! and the engine, which log them and keep going or report them at shutdown.

use std::fmt;

use hub_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised by the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Subscriber answered with a non-2xx status.
    #[error("subscriber answered HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body content, truncated
        body: String,
    },

    /// The coordination store could not be reached.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Store error message
        message: String,
    },

    /// Retry schedule exhausted; the message goes to the dead-letter sink.
    #[error("delivery failed after {attempts} attempts")]
    ScheduleExhausted {
        /// Number of delivery attempts made
        attempts: u32,
    },

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Loops did not finish within the shutdown timeout.
    #[error("shutdown did not complete within {timeout_seconds}s")]
    ShutdownTimeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// A spawned loop panicked.
    #[error("task panicked: {message}")]
    WorkerPanic {
        /// Panic or join error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a status error from an HTTP response.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Creates a schedule exhausted error.
    pub fn schedule_exhausted(attempts: u32) -> Self {
        Self::ScheduleExhausted { attempts }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failure belongs to a single delivery call and may succeed
    /// on a later attempt.
    ///
    /// Every outcome other than 2xx is retryable; the retry schedule alone
    /// decides how often.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::HttpStatus { .. } => true,

            Self::StoreUnavailable { .. }
            | Self::ScheduleExhausted { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::store(err.to_string())
    }
}

/// Category of delivery error, used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx) and other non-2xx statuses.
    Server,
    /// Coordination store failures.
    Store,
    /// Configuration problems.
    Configuration,
    /// Lifecycle and exhaustion.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { status_code, .. } if (400..500).contains(status_code) => {
                Self::Client
            },
            DeliveryError::HttpStatus { .. } => Self::Server,
            DeliveryError::StoreUnavailable { .. } => Self::Store,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::ScheduleExhausted { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

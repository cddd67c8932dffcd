//! Error types for the feed backend client.

use thiserror::Error;

/// Errors that can occur when talking to the feed backend.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No bearer token was supplied for an authenticated call.
    #[error("missing bearer credential")]
    MissingCredential,

    /// HTTP request failed before a response was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("request failed ({status}): {body}")]
    Status { status: u16, body: String },

    /// Rate limited.
    #[error("rate limited{}", match (endpoint, retry_after_secs) {
        (Some(ep), Some(secs)) => format!(" on {} (retry after {}s)", ep, secs),
        (Some(ep), None) => format!(" on {}", ep),
        (None, Some(secs)) => format!(" (retry after {}s)", secs),
        (None, None) => String::new(),
    })]
    RateLimited {
        /// The endpoint that was rate limited (optional).
        endpoint: Option<String>,
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Resource not found.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Response did not have the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Push hub protocol violation.
    #[error("hub protocol error: {0}")]
    Protocol(String),
}

impl ApiError {
    /// Whether the failure is worth retrying (network loss, timeouts, 5xx, 429).
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ApiError::Status { status, .. } => *status >= 500,
            ApiError::RateLimited { .. } | ApiError::WebSocket(_) => true,
            _ => false,
        }
    }

    /// Whether the server answered with something we could not interpret.
    pub fn is_malformed(&self) -> bool {
        match self {
            ApiError::Malformed(_) | ApiError::Json(_) | ApiError::Protocol(_) => true,
            ApiError::Http(e) => e.is_decode(),
            _ => false,
        }
    }
}

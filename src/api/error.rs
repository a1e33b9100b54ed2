use std::time::Duration;

use thiserror::Error;

/// Failure talking to the persistence API. All variants are retryable from
/// the caller's point of view except `Conflict`, which needs a reload first.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The server holds a newer version than the one the draft was based on.
    #[error("update conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid API url: {0}")]
    InvalidUrl(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

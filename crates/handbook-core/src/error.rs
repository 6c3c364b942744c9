//! Error types for the handbook job queue.

use thiserror::Error;

/// Result type alias using the queue's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for job queue operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// OCR provider failed
    #[error("OCR error: {0}")]
    Ocr(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Upstream service throttled the request
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Upstream service returned a server-side failure (5xx)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Operation exceeded its time bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same job later can reasonably succeed.
    ///
    /// Network, database, throttling, upstream 5xx and timeouts are transient.
    /// Bad input, unparseable output and misconfiguration are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::RateLimited(_)
                | Error::Upstream(_)
                | Error::Timeout(_)
                | Error::Request(_)
                | Error::Io(_)
        )
    }

    /// Map an HTTP status from an external service onto the error taxonomy.
    ///
    /// `wrap` builds the permanent variant for the calling service.
    pub fn from_http_status(status: u16, message: String, wrap: fn(String) -> Error) -> Error {
        match status {
            404 => Error::NotFound(message),
            408 => Error::Timeout(message),
            429 => Error::RateLimited(message),
            500..=599 => Error::Upstream(message),
            _ => wrap(message),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

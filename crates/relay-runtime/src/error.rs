//! Error types for relay operations.

use std::time::Duration;
use thiserror::Error;

/// Classified error type for all send, receive, and session operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection failed: {message}")]
    Connect { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Backend throttled the request: {message}")]
    Throttled { message: String },

    #[error("Decode failed: {0}")]
    Decode(#[from] SerializationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend error ({backend}): {code} - {message}")]
    Backend {
        backend: String,
        code: String,
        message: String,
    },
}

impl RelayError {
    /// Check if error is transient and a send may be worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::Timeout { .. } => true,
            Self::Throttled { .. } => true,
            Self::Decode(_) => false,
            Self::Validation(_) => false,
            Self::Backend { .. } => true,
        }
    }
}

/// Errors during payload serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Validation errors, both local (handle construction) and
/// backend-classified (destination rejected by the broker)
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Destination rejected the message: {message}")]
    Rejected { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

//! Error types for queue operations.

use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    NotSupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("Backend error ({backend}): {message}")]
    Backend {
        backend: &'static str,
        message: String,
        transient: bool,
    },

    #[error("Delivery handle not found or already acknowledged: {receipt}")]
    HandleNotFound { receipt: String },

    #[error("Message handler failed: {message}")]
    Handler { message: String },

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl QueueError {
    /// Check if the error is transient: the fetch path absorbs transient
    /// failures as "no messages available now" instead of ending the loop.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => false,
            Self::NotSupported { .. } => false,
            Self::Backend { transient, .. } => *transient,
            Self::HandleNotFound { .. } => false,
            Self::Handler { .. } => false,
            Self::Decode(_) => false,
            Self::Validation(_) => false,
            Self::Configuration(_) => false,
        }
    }

    /// Check if the error signals an absent capability rather than a failure.
    /// Callers branch on this to apply safe defaults (length -> 0,
    /// delete_queue -> no-op).
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    /// Shorthand for a transient backend error.
    pub fn transient(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a permanent backend error.
    pub fn permanent(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
            transient: false,
        }
    }
}

/// Errors at the payload decode boundary.
///
/// Decode failures are isolated per message inside `fetch`: the affected
/// message is logged and skipped, the rest of the batch is still delivered.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

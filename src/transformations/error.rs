//! Handler error types.

use thiserror::Error;

use crate::db::DbError;
use crate::rpc::Retryable;

/// Failure of a pure handler. Any of these aborts the batch it happened in.
#[derive(Debug, Error)]
pub enum TransformationError {
    #[error("Handler '{handler_name}' failed: {message}")]
    HandlerError {
        handler_name: String,
        message: String,
    },

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl TransformationError {
    /// Create a handler error with context.
    pub fn handler(name: &str, message: impl Into<String>) -> Self {
        Self::HandlerError {
            handler_name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Failure of a side-effect handler. Never reaches the ingestion loop.
#[derive(Debug, Error)]
pub enum SideEffectError {
    /// Worth another attempt if the handler's policy allows one.
    #[error("Side effect '{handler_name}' failed: {message}")]
    Failed {
        handler_name: String,
        message: String,
    },

    /// Retrying cannot help.
    #[error("Side effect '{handler_name}' failed permanently: {message}")]
    Permanent {
        handler_name: String,
        message: String,
    },
}

impl SideEffectError {
    pub fn failed(name: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            handler_name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(name: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            handler_name: name.to_string(),
            message: message.into(),
        }
    }
}

impl Retryable for SideEffectError {
    fn is_retryable(&self) -> bool {
        matches!(self, SideEffectError::Failed { .. })
    }
}

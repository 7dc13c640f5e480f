//! Error types for eda-core

use crate::types::IdempotencyStatus;
use thiserror::Error;

/// Errors that can occur in the idempotency and ordering core
#[derive(Debug, Error)]
pub enum EdaError {
    /// Another worker is processing the same key right now
    ///
    /// Not fatal. The message should be redelivered later.
    #[error("Operation already in progress for key '{key}'")]
    OperationInProgress { key: String },

    /// `complete` was called on a key that is not in progress
    #[error("Invalid state transition for key '{key}': observed {observed}")]
    InvalidStateTransition {
        key: String,
        observed: IdempotencyStatus,
    },

    /// Backing state store could not be reached, read, or written
    #[error("State store unavailable: {0}")]
    StateStoreUnavailable(String),

    /// Blob or record reference not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Business logic failure reported by a handler
    #[error("Handler error: {0}")]
    Handler(String),
}

impl EdaError {
    /// Whether redelivering the message later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EdaError::OperationInProgress { .. } | EdaError::StateStoreUnavailable(_)
        )
    }
}

/// Result type alias for eda-core operations
pub type Result<T> = std::result::Result<T, EdaError>;

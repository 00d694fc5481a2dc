//! Error types for the binding layer.

use crate::types::ServiceError;
use thiserror::Error;

/// Main error type for binding operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or unusable configuration (e.g. no database URL).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A query refinement that is not valid for the current query.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Database instance has been disposed")]
    Disposed,

    /// Failure reported by the native sync service.
    #[error("Operation failed: {0}")]
    Operation(ServiceError),

    /// The completion of a deferred result was dropped without firing.
    #[error("Operation abandoned before completion")]
    Abandoned,

    #[error("Timed out waiting for operation")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<ServiceError> for BridgeError {
    fn from(e: ServiceError) -> Self {
        BridgeError::Operation(e)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl BridgeError {
    /// The native error behind this error, if it came from the service.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            BridgeError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for binding operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

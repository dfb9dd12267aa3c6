//! Error types shared by every cadence crate.

use std::time::Duration;

use thiserror::Error;

use crate::sync::{classify_http_status, RetryClass};

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the network collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkError {
    /// HTTP status, absent for transport-level failures.
    pub status: Option<u16>,
    pub message: String,
    /// True when the request never reached the server (connect refused, DNS, offline).
    pub connectivity: bool,
}

impl NetworkError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            connectivity: false,
        }
    }

    pub fn transport(message: impl Into<String>, connectivity: bool) -> Self {
        Self {
            status: None,
            message: message.into(),
            connectivity,
        }
    }

    /// Classify for retry policy. Transport failures are always retryable.
    pub fn retry_class(&self) -> RetryClass {
        match self.status {
            Some(status) => classify_http_status(status),
            None => RetryClass::Retryable,
        }
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "({}) {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Errors that can occur inside the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Network collaborator failure
    #[error("Network error: {0}")]
    Network(NetworkError),

    /// Local cache backend failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A time-boxed call did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was superseded or the engine shut down
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid request (bad field name, malformed payload, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn network(err: NetworkError) -> Self {
        Self::Network(err)
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// True when the failure means the client is offline.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(err) if err.connectivity)
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Network(err) => err.retry_class(),
            Self::Timeout(_) | Self::Cancelled | Self::Cache(_) => RetryClass::Retryable,
            Self::Json(_) | Self::InvalidRequest(_) => RetryClass::Permanent,
        }
    }
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        Self::Network(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_is_retryable_connectivity() {
        let err = Error::from(NetworkError::transport("connection refused", true));
        assert!(err.is_connectivity());
        assert_eq!(err.retry_class(), RetryClass::Retryable);
    }

    #[test]
    fn unprocessable_entity_is_permanent() {
        let err = Error::from(NetworkError::status(422, "bad payload"));
        assert!(!err.is_connectivity());
        assert_eq!(err.retry_class(), RetryClass::Permanent);
    }

    #[test]
    fn network_error_display_includes_status() {
        let err = NetworkError::status(503, "unavailable");
        assert_eq!(err.to_string(), "(503) unavailable");
    }
}

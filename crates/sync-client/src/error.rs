//! Error types for the sync HTTP client.

use cadence_core::sync::{classify_http_status, RetryClass};
use cadence_core::NetworkError;
use thiserror::Error;

/// Result type alias for sync client operations.
pub type Result<T> = std::result::Result<T, SyncClientError>;

/// Errors that can occur while talking to the collection API.
#[derive(Debug, Error)]
pub enum SyncClientError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the server
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (missing configuration, malformed header, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (invalid token format)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl SyncClientError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// True when the request never reached the server.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) => RetryClass::Retryable,
            Self::Json(_) => RetryClass::Permanent,
            Self::InvalidRequest(_) => RetryClass::Permanent,
            Self::Auth(_) => RetryClass::ReauthRequired,
        }
    }
}

impl From<SyncClientError> for NetworkError {
    fn from(err: SyncClientError) -> Self {
        match &err {
            SyncClientError::Api { status, message } => NetworkError::status(*status, message),
            SyncClientError::Auth(_) => NetworkError::status(401, err.to_string()),
            SyncClientError::Json(_) | SyncClientError::InvalidRequest(_) => {
                NetworkError::status(400, err.to_string())
            }
            SyncClientError::Http(inner) => match inner.status() {
                Some(status) => NetworkError::status(status.as_u16(), err.to_string()),
                None => NetworkError::transport(err.to_string(), err.is_connectivity()),
            },
        }
    }
}

impl From<SyncClientError> for cadence_core::Error {
    fn from(err: SyncClientError) -> Self {
        cadence_core::Error::Network(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = SyncClientError::api(401, "unauthorized");
        assert_eq!(err.retry_class(), RetryClass::ReauthRequired);
    }

    #[test]
    fn api_error_maps_to_network_status() {
        let err: cadence_core::Error = SyncClientError::api(503, "maintenance").into();
        match err {
            cadence_core::Error::Network(network) => {
                assert_eq!(network.status, Some(503));
                assert!(!network.connectivity);
                assert_eq!(network.retry_class(), RetryClass::Retryable);
            }
            other => panic!("expected network error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_response_is_permanent() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let network: NetworkError = SyncClientError::Json(json_err).into();
        assert_eq!(network.retry_class(), RetryClass::Permanent);
    }
}

//! Common error types for the cluster
//!
//! This module defines all error types used across the broker, shard agents and callers.
//! Broker rejections keep the wire status code they arrived with.

use cluster_proto::StatusCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for the cluster
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Peer violated the message contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The broker answered with a non-success status
    #[error("Rejected with status {code}: {message}")]
    Rejected { code: StatusCode, message: String },

    /// Operation requires a live broker connection
    #[error("Not connected to the cluster")]
    NotConnected,

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout(err.to_string())
    }
}

impl From<tungstenite::http::header::InvalidHeaderValue> for ClusterError {
    fn from(err: tungstenite::http::header::InvalidHeaderValue) -> Self {
        ClusterError::InvalidInput(format!("invalid header value: {}", err))
    }
}

impl ClusterError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ClusterError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        ClusterError::Connection(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ClusterError::InvalidInput(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        ClusterError::Protocol(msg.into())
    }

    /// Create a rejection from a broker status
    pub fn rejected(code: StatusCode, msg: impl Into<String>) -> Self {
        ClusterError::Rejected {
            code,
            message: msg.into(),
        }
    }

}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_keeps_status() {
        let err = ClusterError::rejected(StatusCode::Forbidden, "Invalid secret key!");
        assert!(matches!(
            err,
            ClusterError::Rejected {
                code: StatusCode::Forbidden,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "Rejected with status 403: Invalid secret key!"
        );
    }

    #[tokio::test]
    async fn test_elapsed_becomes_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();

        let err = ClusterError::from(elapsed);
        assert!(matches!(err, ClusterError::Timeout(_)));
        assert!(err.to_string().starts_with("Operation timed out"));
    }

    #[test]
    fn test_invalid_header_is_invalid_input() {
        let invalid = tungstenite::http::HeaderValue::from_str("line\nbreak").unwrap_err();
        assert!(matches!(
            ClusterError::from(invalid),
            ClusterError::InvalidInput(_)
        ));
    }
}

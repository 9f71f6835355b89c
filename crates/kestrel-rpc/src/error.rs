//! Error types for Kestrel RPC.
//!
//! Every failure a caller can observe is an [`RpcError`], delivered through
//! the same callback or future that would have carried the response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;

/// Main error type for the RPC layer.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    // Request lifecycle errors
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Remote exception {class_name}: {message}")]
    RemoteException { class_name: String, message: String },

    #[error("{message}")]
    NoValidResult { message: String },

    #[error("No sender available for request")]
    NoSenderAvailable,

    #[error("Client uplink is overloaded: {pending} requests in flight")]
    Overloaded { pending: usize },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Serialization errors
    #[error("Serialization error for {type_name}: {message}")]
    Serialization { type_name: String, message: String },

    #[error("Message type not registered: {type_name}")]
    UnregisteredType { type_name: String },

    // Network errors
    #[error("Connect to {endpoint} failed: {message}")]
    Connect { endpoint: SocketAddr, message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl RpcError {
    /// Default error surfaced when a first-valid-result call finds nothing valid.
    pub fn no_valid_result() -> Self {
        RpcError::NoValidResult {
            message: "No valid result".to_string(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        RpcError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(type_name: &str, err: CodecError) -> Self {
        RpcError::Serialization {
            type_name: type_name.to_string(),
            message: err.to_string(),
        }
    }

    /// True for errors that invalidate the connection they occurred on.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol { .. } | RpcError::FrameTooLarge { .. }
        )
    }

    /// Check if a caller may reasonably retry the request.
    ///
    /// Nothing in this crate retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout(_)
                | RpcError::ConnectionClosed
                | RpcError::NoSenderAvailable
                | RpcError::Overloaded { .. }
                | RpcError::Connect { .. }
                | RpcError::Io { .. }
        )
    }
}

use std::time::Duration;

use thiserror::Error;

/// Result type for sync engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport dropped while the request was in flight.
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Request {request_id} timed out after {timeout:?}")]
    RequestTimeout {
        request_id: String,
        timeout: Duration,
    },

    #[error("Server rejected request: {message}")]
    ServerRejected { message: String },

    #[error("No subscription for document {document} in collection {collection}")]
    UnknownDocument {
        collection: String,
        document: String,
    },

    #[error("Unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Failed to apply operation: {0}")]
    Apply(#[from] ApplyError),

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        SyncError::InvalidState {
            message: message.into(),
        }
    }
}

/// Errors raised while applying an operation to a document tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("path {path} is already occupied")]
    Occupied { path: String },

    #[error("path {path} not found")]
    NotFound { path: String },

    #[error("parent of {path} is not a container")]
    InvalidTarget { path: String },

    #[error("invalid array index in {path}")]
    InvalidIndex { path: String },
}

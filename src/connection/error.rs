//! Error types for the repository boundary
//!
//! Every request sent to a shard either succeeds or fails with a
//! [`RequestError`]. Only `ServerRejected` is non-fatal: it concerns a single
//! document and the connection stays usable.

use thiserror::Error;

/// Errors raised by connections and admin sessions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Host unreachable or credentials invalid while opening a connection
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The repository refused one document (bad format, constraint, transform)
    #[error("Server rejected {uri}: {message}")]
    ServerRejected { uri: String, message: String },

    /// The connection dropped mid-request
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The session lacks the privilege for the request
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The open transaction could not be committed
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// The connection was already closed
    #[error("Connection is closed")]
    Closed,
}

/// Result type for repository requests
pub type RequestResult<T> = std::result::Result<T, RequestError>;

impl RequestError {
    /// Create a new connectivity error
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    /// Create a new per-document rejection
    pub fn rejected(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerRejected {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// Create a new connection lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    /// Create a new permission error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    /// Create a new commit error
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed(message.into())
    }

    /// Everything except a per-document rejection aborts the task
    pub fn is_fatal(&self) -> bool {
        !self.is_rejection()
    }

    /// Check if this is a per-document rejection
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::ServerRejected { .. })
    }

    /// Check if this is a connection lost error
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Connectivity(_))
    }

    /// Check if this is a permission error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// The document a rejection refers to
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::ServerRejected { uri, .. } => Some(uri),
            _ => None,
        }
    }
}

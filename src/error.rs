//! Error handling for Shardpump
//!
//! This module provides the crate error type and result alias. Failures that
//! happen at the repository boundary are described by
//! [`RequestError`](crate::connection::RequestError) and are wrapped here
//! together with the shard they happened on.

use std::io;
use thiserror::Error;

use crate::connection::RequestError;
use crate::shard::ShardId;

/// Errors that can occur in Shardpump operations
#[derive(Error, Debug)]
pub enum Error {
    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to the shard topology
    #[error("Topology error: {0}")]
    Topology(String),

    /// The output directory exists and the job would write into it
    #[error("Output directory already exists: {0}")]
    OutputExists(String),

    /// A document identifier failed validation
    #[error("Invalid document URI: {0}")]
    InvalidUri(String),

    /// A document value could not be turned into a payload
    #[error("Content error: {0}")]
    Content(String),

    /// A fatal repository error on one shard; aborts the task
    #[error("Shard {shard} failed: {source}")]
    Shard {
        shard: ShardId,
        #[source]
        source: RequestError,
    },

    /// A per-document rejection promoted to fatal because errors are not tolerated
    #[error("Document {uri} rejected: {message}")]
    Rejected { uri: String, message: String },

    /// Errors related to data corruption
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Generic error type for other cases
    #[error("{0}")]
    Other(String),
}

/// Result type for Shardpump operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new topology error
    pub fn topology(message: impl Into<String>) -> Self {
        Self::Topology(message.into())
    }

    /// Create a new invalid URI error
    pub fn invalid_uri(message: impl Into<String>) -> Self {
        Self::InvalidUri(message.into())
    }

    /// Create a new content error
    pub fn content(message: impl Into<String>) -> Self {
        Self::Content(message.into())
    }

    /// Wrap a repository error with the shard it happened on
    pub fn shard(shard: impl Into<ShardId>, source: RequestError) -> Self {
        Self::Shard {
            shard: shard.into(),
            source,
        }
    }

    /// Create a new corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Check if this is a fatal per-shard error
    pub fn is_fatal_shard_error(&self) -> bool {
        matches!(self, Self::Shard { source, .. } if source.is_fatal())
    }

    /// Check if this is a promoted per-document rejection
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The shard an error is attributed to, if any
    pub fn shard_id(&self) -> Option<&str> {
        match self {
            Self::Shard { shard, .. } => Some(shard),
            _ => None,
        }
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::OutputExists(_) => {
                Some("Remove the output directory or enable clean_output_dir".to_string())
            }
            Self::Shard { source, .. } if source.is_permission_denied() => {
                Some("Verify the loading user holds insert privileges on the target database".to_string())
            }
            Self::Shard { source, .. } if source.is_connection_lost() => {
                Some("The task can be retried; placement is deterministic for the same input".to_string())
            }
            Self::Rejected { .. } => {
                Some("Enable tolerate_errors to skip rejected documents".to_string())
            }
            Self::Corruption(_) => Some("Re-run job validation to regenerate the topology file".to_string()),
            _ => None,
        }
    }
}

// Conversion from bincode error to Shardpump error
impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Corruption(format!("Bincode error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("batch size");
        assert!(matches!(err, Error::Config(_)));

        let err = Error::shard("forest-a", RequestError::connection_lost("reset by peer"));
        assert!(err.is_fatal_shard_error());
        assert_eq!(err.shard_id(), Some("forest-a"));

        let err = Error::shard("forest-a", RequestError::rejected("/a.xml", "bad markup"));
        assert!(!err.is_fatal_shard_error());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_suggestion() {
        let err = Error::OutputExists("/load/".to_string());
        assert!(err.suggestion().unwrap().contains("clean_output_dir"));

        let err = Error::shard("f", RequestError::permission_denied("no insert"));
        assert!(err.suggestion().unwrap().contains("privileges"));

        assert!(Error::other("x").suggestion().is_none());
        assert!(err.to_string().contains("Shard f failed"));
    }
}

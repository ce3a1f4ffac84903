//! Storage layer error types
//!
//! Defines all errors that can occur while reading or writing the on-disk
//! chunked format.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O failure tied to a specific file
    #[error("IO error on {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, invalid magic, truncated record)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// A text field could not be parsed
    #[error("Parse error at {location}: {message}")]
    Parse { location: String, message: String },

    /// Two arrays that must line up do not
    #[error("Length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },

    /// A village was matched to more darkspots than the configured bound allows
    #[error("Village {village} has {count} matches, more than the maximum of {max}")]
    MatchLimitExceeded { village: usize, count: usize, max: usize },

    /// An entity id does not fit the dense id space
    #[error("Id {id} out of range for {count} entities")]
    IdOutOfRange { id: i64, count: usize },

    /// Invalid date key or date directory
    #[error("Invalid date: {0}")]
    InvalidDate(String),
}

impl StorageError {
    /// Attach a path to an I/O error
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::File {
            path: path.into(),
            source,
        }
    }

    /// Build a parse error for a given location (file and line, usually)
    pub fn parse(location: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StorageError::Parse {
            location: location.into(),
            message: message.to_string(),
        }
    }

    /// True when the error means the file simply is not there
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::Io(e) | StorageError::File { source: e, .. } => {
                e.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for StorageError {
    fn from(err: csv::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

//! Pipeline error types
//!
//! Everything here is fatal for the stage that returns it. Recoverable
//! per-unit problems never become a `PipelineError`; they go to the stage log.

use crate::config::ConfigError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors that abort a pipeline stage
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A raw input line could not be interpreted
    #[error("Malformed input {location}: {message}")]
    Input { location: String, message: String },

    /// A stage was started before the stage it depends on finished
    #[error("Stage {stage} requires {requires} to have completed")]
    MissingPrerequisite { stage: String, requires: String },

    /// A worker task panicked or was cancelled
    #[error("Worker failed: {0}")]
    Worker(String),

    /// A spot check found stored data disagreeing with its source
    #[error("Verification failed: {0}")]
    Verification(String),
}

impl PipelineError {
    pub fn input(location: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PipelineError::Input {
            location: location.into(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(StorageError::Io(err))
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Worker(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Storage(StorageError::from(err))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

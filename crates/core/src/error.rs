//! Error types for the distributed checkpointing system

use thiserror::Error;

use crate::types::StrategyId;

/// Result type alias using the checkpointing Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the distributed checkpointing system
#[derive(Error, Debug)]
pub enum Error {
    // Strategy resolution errors
    #[error("Backend unavailable for {id}: {reason}. Hint: {hint}")]
    BackendUnavailable {
        id: StrategyId,
        reason: String,
        hint: String,
    },

    #[error("No default strategy registered for {id}")]
    StrategyNotFound { id: StrategyId },

    // Checkpoint compatibility errors
    #[error("Incompatible checkpoint for {strategy}: {reason}")]
    IncompatibleCheckpoint { strategy: String, reason: String },

    #[error("Operation `{operation}` is not supported by {strategy}")]
    UnsupportedOperation {
        strategy: String,
        operation: String,
    },

    // State dict errors
    #[error("Invalid state dict entry `{key}`: {reason}")]
    InvalidStateDict { key: String, reason: String },

    // Checkpoint write errors
    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::CheckpointWriteFailed { .. } | Error::Io(_)
        )
    }

    /// Returns true if retrying cannot help (wrong format, missing strategy)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleCheckpoint { .. }
                | Error::StrategyNotFound { .. }
                | Error::UnsupportedOperation { .. }
                | Error::InvalidStateDict { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

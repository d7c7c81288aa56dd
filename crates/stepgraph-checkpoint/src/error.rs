//! Error types for channel and checkpoint operations

use thiserror::Error;

/// Result type for channel and checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while updating channels or persisting checkpoints
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Channel read before any write and without a default value
    #[error("Channel '{0}' is empty")]
    EmptyChannel(String),

    /// Channel received writes that violate its reducer contract
    #[error("Invalid update for channel '{channel}': {reason}")]
    InvalidUpdate { channel: String, reason: String },

    /// Checkpoint not found
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Invalid checkpoint payload
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),
}

impl CheckpointError {
    /// Invalid-update error for the given channel.
    pub fn invalid_update(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

//! Error types for the fleet node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur running a node.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid environment or configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metadata file could not be decoded
    #[error("Metadata error: {0}")]
    Metadata(#[from] fleet_metadata::DecodeError),

    /// Learning loop error
    #[error("Learning error: {0}")]
    Learning(#[from] fleet_learning::LearningError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

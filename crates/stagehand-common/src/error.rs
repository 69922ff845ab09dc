//! Error types for stagehand

use thiserror::Error;

/// Result type alias for stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;

/// Main error type for stagehand
#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Unknown destination type: {0}")]
    UnknownDestination(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

//! Error types shared across lakeload crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, LakeloadError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum LakeloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}


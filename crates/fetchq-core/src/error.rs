//! Error types for fetchq core

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in fetchq core
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Engine instance is closed")]
    EngineClosed,

    #[error("A download for {0} already exists")]
    DuplicateRequest(PathBuf),

    #[error("Invalid concurrent limit: {0}")]
    InvalidConcurrentLimit(i64),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Download not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transfer error: {0}")]
    Transport(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("No default configuration has been set")]
    NotConfigured,
}

impl FetchError {
    /// Check if a transfer that failed with this error may be retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Io(_))
    }

    /// Check if this error means the catalog could not be read or written
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            FetchError::Database(_) | FetchError::StorageUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::Serialization(error.to_string())
    }
}

impl From<fetchq_types::ParseEnumError> for FetchError {
    fn from(error: fetchq_types::ParseEnumError) -> Self {
        FetchError::Serialization(error.to_string())
    }
}

//! Error types for agentledger-core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the agentledger-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Host runtime API error
    #[error("host error: {0}")]
    Host(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Snapshot storage root does not exist
    #[error("snapshot storage not found: {0}")]
    StorageNotFound(PathBuf),
}

/// Result type alias for agentledger-core
pub type Result<T> = std::result::Result<T, Error>;

//! Common error types for coordcheck

use thiserror::Error;

/// Common result type for coordcheck operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the coordcheck services
///
/// A cache miss is not an error: catalog lookups return `Ok(None)` for
/// missing entries and reserve `Error` for genuine dependency failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

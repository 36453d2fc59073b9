//! Error types for Gatehouse.

use thiserror::Error;

/// Main error type for Gatehouse operations.
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential database errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Encryption or decryption failures
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Secret key file is missing, unreadable or malformed
    #[error("Key file error: {0}")]
    KeyFile(String),

    /// Persisted or remote data that cannot be interpreted
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Shared bucket store errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatehouse operations.
pub type Result<T> = std::result::Result<T, GatehouseError>;

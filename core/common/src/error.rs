//! Common error types for CipherChat.

use thiserror::Error;

/// Top-level error type for CipherChat operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key management operation failed.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Relay protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Account is locked out.
    #[error("Account locked: {0}")]
    Locked(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the chain core

use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Validation outcomes are NOT errors: a corrupted block is reported as a
/// [`crate::types::BlockValidity`] value so the read path never throws for
/// expected-but-exceptional conditions.
#[derive(Error, Debug)]
pub enum Error {
    /// Write-lock deadline expired before the lock became available
    #[error("Lock acquisition timed out after {waited_ms}ms")]
    LockTimeout {
        /// Milliseconds spent waiting
        waited_ms: u64,
    },

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Block not found at sequence number
    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    /// Authorized key not found
    #[error("Authorized key not found: {0}")]
    KeyNotFound(Uuid),

    /// Block rejected before append
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Signing or signature verification failed
    #[error("Signature error: {0}")]
    Signature(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

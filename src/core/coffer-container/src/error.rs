//! Container error types.

use coffer_encryption::EncryptionError;
use coffer_storage::StorageError;
use thiserror::Error;

/// Errors raised by the encryption container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// An item operation was issued without a partition key.
    #[error("a partition key must be provided for {0} on an encryption container")]
    PartitionKeyRequired(&'static str),

    /// The operation is not supported with this container's configuration.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Encryption or decryption error.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// Storage error, kept unchanged.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An item could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ContainerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

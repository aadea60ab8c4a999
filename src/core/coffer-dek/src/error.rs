//! DEK error types.

use coffer_crypto::AlgorithmFamily;
use thiserror::Error;

/// Errors raised by the DEK store, cache and provider.
#[derive(Debug, Error)]
pub enum DekError {
    /// The provider was used before [`crate::DataEncryptionKeyProvider::initialize`].
    #[error("data encryption key provider was not initialized")]
    NotInitialized,

    /// The provider was initialized twice.
    #[error("data encryption key provider is already initialized")]
    AlreadyInitialized,

    /// The DEK container is not usable.
    #[error("invalid data encryption key container: {0}")]
    InvalidContainer(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No wrap provider is configured for the algorithm family.
    #[error("no key wrap provider configured for {0} algorithms")]
    ProviderNotConfigured(AlgorithmFamily),

    /// The requested algorithm change is not supported.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Rewrap kept racing with concurrent updates.
    #[error("data encryption key {0} kept changing during rewrap")]
    ConcurrentModification(String),

    /// The stored record could not be decoded.
    #[error("malformed data encryption key record: {0}")]
    Serialization(String),

    /// Key wrap error.
    #[error("key wrap error: {0}")]
    KeyWrap(#[from] coffer_keywrap::KeyWrapError),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] coffer_crypto::CryptoError),

    /// Storage error, kept unchanged (not found, conflict, forbidden).
    #[error("storage error: {0}")]
    Storage(#[from] coffer_storage::StorageError),
}

impl From<serde_json::Error> for DekError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

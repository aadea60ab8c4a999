//! Key vault error types.

use thiserror::Error;

/// Errors raised by key vault clients.
///
/// Not-found, null-result and request-failed conditions are distinct so
/// callers can tell a missing key from a misbehaving vault.
#[derive(Debug, Error)]
pub enum KeyVaultError {
    /// Key URI could not be parsed or does not belong to this vault.
    #[error("invalid key uri: {0}")]
    InvalidKeyUri(String),

    /// Invalid key name.
    #[error("invalid key name: {0}")]
    InvalidKeyName(String),

    /// Key or key version not found.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Key already exists.
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// Key is disabled.
    #[error("key is disabled: {0}")]
    KeyDisabled(String),

    /// The vault answered without the expected result.
    #[error("key vault returned no result: {0}")]
    NullResult(String),

    /// Algorithm not usable with the key type.
    #[error("algorithm {algorithm} not supported by key type {key_type}")]
    UnsupportedAlgorithm {
        /// Requested algorithm.
        algorithm: String,
        /// Type of the master key.
        key_type: String,
    },

    /// Caller is not authorized.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The wrap or unwrap operation was rejected.
    #[error("wrap/unwrap failure: {0}")]
    WrapUnwrapFailure(String),

    /// The vault cannot be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The vault answered with an unexpected status.
    #[error("request failed with status {status}: {message}")]
    RequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message returned by the vault.
        message: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] coffer_crypto::CryptoError),
}

impl From<coffer_storage::StorageError> for KeyVaultError {
    fn from(err: coffer_storage::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

//! Encryption error types.

use coffer_dek::DekError;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while encrypting or decrypting documents.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// A path cannot be encrypted.
    #[error("invalid path to encrypt '{path}': {reason}")]
    InvalidPath {
        /// Offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid encryption options.
    #[error("invalid encryption options: {0}")]
    InvalidOptions(String),

    /// Invalid client encryption policy.
    #[error("invalid client encryption policy: {0}")]
    InvalidPolicy(String),

    /// The document cannot be processed.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A data encryption key could not be found.
    #[error("{message}")]
    InvalidArgument {
        /// Names the missing key.
        message: String,
        /// Underlying lookup failure.
        #[source]
        source: DekError,
    },

    /// A step returned an unusable result.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A document could not be decrypted.
    #[error("failed to decrypt content encrypted with data encryption key '{data_encryption_key_id}'")]
    DecryptionFailed {
        /// Key the failing content was encrypted with.
        data_encryption_key_id: String,
        /// The document, still encrypted.
        encrypted_content: Box<Value>,
        /// Underlying failure.
        #[source]
        source: Box<EncryptionError>,
    },

    /// DEK error.
    #[error("data encryption key error: {0}")]
    Dek(#[from] DekError),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] coffer_crypto::CryptoError),

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EncryptionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl EncryptionError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

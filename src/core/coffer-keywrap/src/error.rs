//! Key wrap error types.

use coffer_keyvault::KeyVaultError;
use thiserror::Error;

/// Errors raised by key wrap providers.
#[derive(Debug, Error)]
pub enum KeyWrapError {
    /// A required key argument was empty.
    #[error("argument cannot be empty: {0}")]
    ArgumentNull(&'static str),

    /// Wrap metadata does not identify a usable master key.
    #[error("invalid key wrap metadata: {0}")]
    InvalidMetadata(String),

    /// Key-encryption algorithm not supported by this provider.
    #[error("unsupported key-encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Master key metadata signature did not verify.
    #[error("master key metadata signature verification failed for {0}")]
    SignatureVerificationFailed(String),

    /// The master key allows purging.
    #[error("master key {0} is not protected against deletion")]
    DeletionProtectionRequired(String),

    /// The key vault could not complete the request.
    #[error("key vault access failed: {message}")]
    Access {
        /// What was being attempted.
        message: String,
        /// Underlying vault error.
        #[source]
        source: KeyVaultError,
    },
}

impl KeyWrapError {
    /// Classifies a vault error raised while working on `target`.
    ///
    /// A master key the vault does not know is a metadata problem; anything
    /// else is an access failure that keeps the vault error as its source.
    pub fn from_vault(target: &str, err: KeyVaultError) -> Self {
        match err {
            KeyVaultError::KeyNotFound(_) | KeyVaultError::InvalidKeyUri(_) => {
                Self::InvalidMetadata(format!("{target}: {err}"))
            }
            source => Self::Access {
                message: format!("operation on {target} failed"),
                source,
            },
        }
    }
}

//! Cryptographic error types.

use thiserror::Error;

/// Errors raised by ciphers, key derivation and key holders.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// HKDF could not produce the requested subkey.
    #[error("key derivation failed: {0}")]
    KeyGenerationFailed(String),

    /// Sealing failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Opening failed, usually because the tag did not verify.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key material of the wrong length.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Malformed ciphertext or parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Algorithm name not recognized.
    #[error("unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Cell ciphertext carries the format version of another algorithm family.
    #[error("algorithm mismatch: cipher is configured for '{expected}' but data was produced by '{found}'")]
    AlgorithmMismatch {
        /// Algorithm of the cipher.
        expected: String,
        /// Algorithm recorded in the ciphertext.
        found: String,
    },

    /// Deterministic encryption requested from a legacy cipher.
    #[error("encryption type '{encryption_type}' is not supported by algorithm '{algorithm}'")]
    UnsupportedEncryptionType {
        /// Requested encryption type.
        encryption_type: String,
        /// Algorithm of the cipher.
        algorithm: String,
    },
}

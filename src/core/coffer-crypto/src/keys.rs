//! Secret key holders, erased from memory on drop.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{check_key, KEY_SIZE};
use crate::error::CryptoError;
use crate::random::generate_key;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyBytes([u8; KEY_SIZE]);

impl KeyBytes {
    fn random() -> Self {
        Self(*generate_key())
    }

    fn copy_from(bytes: &[u8]) -> Result<Self, CryptoError> {
        check_key(bytes)?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }
}

/// Root key of a local key vault.
///
/// Each master key version stored by the vault is encrypted under a subkey
/// of this one.
#[derive(Clone)]
pub struct MasterKey(KeyBytes);

impl MasterKey {
    /// Generates a random root key.
    pub fn generate() -> Self {
        Self(KeyBytes::random())
    }

    /// Loads a root key from its 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        KeyBytes::copy_from(bytes).map(Self)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0 .0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Plaintext data encryption key, before wrapping or after unwrapping.
#[derive(Clone)]
pub struct DataEncryptionKey(KeyBytes);

impl DataEncryptionKey {
    /// Generates a fresh data encryption key.
    pub fn generate() -> Self {
        Self(KeyBytes::random())
    }

    /// Takes an unwrapped key.
    ///
    /// # Errors
    ///
    /// Fails with [`CryptoError::InvalidKey`] unless `bytes` is 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        KeyBytes::copy_from(bytes).map(Self)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0 .0
    }
}

impl std::fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataEncryptionKey([REDACTED])")
    }
}

//! Byte-level encryption under a DEK.

use std::sync::Arc;

use async_trait::async_trait;
use coffer_crypto::{CellCipher, EncryptionAlgorithm, EncryptionType};
use coffer_dek::{DataEncryptionKeyResolver, DekError};
use coffer_storage::StorageError;
use zeroize::Zeroizing;

use crate::error::EncryptionError;

/// Encrypts and decrypts opaque payloads under a DEK.
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypts `plaintext` with the DEK `data_encryption_key_id`.
    async fn encrypt(
        &self,
        plaintext: &[u8],
        data_encryption_key_id: &str,
        algorithm: EncryptionAlgorithm,
        encryption_type: EncryptionType,
    ) -> Result<Vec<u8>, EncryptionError>;

    /// Decrypts `ciphertext` with the DEK `data_encryption_key_id`.
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        data_encryption_key_id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError>;
}

/// [`Encryptor`] backed by a DEK resolver, usually a
/// [`coffer_dek::DataEncryptionKeyProvider`].
pub struct DataEncryptionKeyProviderEncryptor {
    resolver: Arc<dyn DataEncryptionKeyResolver>,
}

impl DataEncryptionKeyProviderEncryptor {
    /// Creates an encryptor over `resolver`.
    pub fn new(resolver: Arc<dyn DataEncryptionKeyResolver>) -> Self {
        Self { resolver }
    }

    async fn cipher(
        &self,
        id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Arc<CellCipher>, EncryptionError> {
        match self.resolver.fetch_data_encryption_key(id, algorithm).await {
            Ok(Some(cipher)) => Ok(cipher),
            Ok(None) => Err(EncryptionError::InvalidOperation(format!(
                "fetch_data_encryption_key returned no key for data encryption key '{id}'"
            ))),
            Err(source @ DekError::Storage(StorageError::NotFound(_))) => {
                Err(EncryptionError::InvalidArgument {
                    message: format!("failed to retrieve data encryption key with id '{id}'"),
                    source,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Encryptor for DataEncryptionKeyProviderEncryptor {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        data_encryption_key_id: &str,
        algorithm: EncryptionAlgorithm,
        encryption_type: EncryptionType,
    ) -> Result<Vec<u8>, EncryptionError> {
        let cipher = self.cipher(data_encryption_key_id, algorithm).await?;
        Ok(cipher.encrypt(plaintext, encryption_type)?)
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        data_encryption_key_id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        let cipher = self.cipher(data_encryption_key_id, algorithm).await?;
        Ok(cipher.decrypt(ciphertext)?)
    }
}

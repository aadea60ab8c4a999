//! Key store provider contract and its wrap adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coffer_keyvault::KeyWrapAlgorithm;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::KeyWrapError;
use crate::metadata::EncryptionKeyWrapMetadata;
use crate::provider::{KeyUnwrapResult, KeyWrapProvider, KeyWrapResult, DEFAULT_CLIENT_CACHE_TTL};

/// A master key store addressed by provider name and master key path.
#[async_trait]
pub trait KeyStoreProvider: Send + Sync {
    /// Name recorded as the wrap metadata type.
    fn provider_name(&self) -> &str;

    /// Wraps `key` under the master key at `master_key_path`.
    async fn wrap_key(
        &self,
        master_key_path: &str,
        algorithm: KeyWrapAlgorithm,
        key: &[u8],
    ) -> Result<Vec<u8>, KeyWrapError>;

    /// Unwraps a key produced by [`KeyStoreProvider::wrap_key`].
    async fn unwrap_key(
        &self,
        master_key_path: &str,
        algorithm: KeyWrapAlgorithm,
        wrapped_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeyWrapError>;

    /// Signs the master key metadata.
    async fn sign(&self, master_key_path: &str, allow_enclave: bool)
        -> Result<Vec<u8>, KeyWrapError>;

    /// Verifies a signature produced by [`KeyStoreProvider::sign`].
    async fn verify(
        &self,
        master_key_path: &str,
        allow_enclave: bool,
        signature: &[u8],
    ) -> Result<bool, KeyWrapError>;
}

/// Adapts a [`KeyStoreProvider`] to [`KeyWrapProvider`].
///
/// The wrapped form is `[u16 BE signature length][signature][wrapped key]`.
/// The signature covers the master key metadata and is verified before
/// every unwrap.
pub struct KeyStoreWrapProvider {
    provider: Arc<dyn KeyStoreProvider>,
    client_cache_ttl: Duration,
}

impl KeyStoreWrapProvider {
    /// Wraps `provider` with the default cache TTL.
    pub fn new(provider: Arc<dyn KeyStoreProvider>) -> Self {
        Self {
            provider,
            client_cache_ttl: DEFAULT_CLIENT_CACHE_TTL,
        }
    }

    /// Overrides how long unwrapped keys may be cached.
    pub fn with_client_cache_ttl(mut self, ttl: Duration) -> Self {
        self.client_cache_ttl = ttl;
        self
    }

    /// Name of the underlying key store provider.
    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    fn check_metadata(
        &self,
        metadata: &EncryptionKeyWrapMetadata,
    ) -> Result<KeyWrapAlgorithm, KeyWrapError> {
        if metadata.type_ != self.provider.provider_name() {
            return Err(KeyWrapError::InvalidMetadata(format!(
                "metadata type {} does not match key store provider {}",
                metadata.type_,
                self.provider.provider_name()
            )));
        }
        if metadata.value.is_empty() {
            return Err(KeyWrapError::InvalidMetadata(
                "master key path is empty".to_string(),
            ));
        }

        let algorithm = metadata.algorithm.as_deref().ok_or_else(|| {
            KeyWrapError::InvalidMetadata(format!(
                "no key-encryption algorithm for {}",
                metadata.value
            ))
        })?;
        algorithm
            .parse()
            .map_err(|_| KeyWrapError::UnsupportedAlgorithm(algorithm.to_string()))
    }
}

fn split_envelope(envelope: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = envelope.split_first_chunk::<2>()?;
    let len = u16::from_be_bytes(*len) as usize;
    if rest.len() <= len {
        return None;
    }
    Some(rest.split_at(len))
}

#[async_trait]
impl KeyWrapProvider for KeyStoreWrapProvider {
    async fn wrap_key(
        &self,
        key: &[u8],
        metadata: &EncryptionKeyWrapMetadata,
    ) -> Result<KeyWrapResult, KeyWrapError> {
        if key.is_empty() {
            return Err(KeyWrapError::ArgumentNull("key"));
        }
        let algorithm = self.check_metadata(metadata)?;

        let wrapped = self.provider.wrap_key(&metadata.value, algorithm, key).await?;
        let signature = self.provider.sign(&metadata.value, false).await?;
        let signature_len = u16::try_from(signature.len()).map_err(|_| {
            KeyWrapError::InvalidMetadata("master key signature too long".to_string())
        })?;

        let mut envelope = Vec::with_capacity(2 + signature.len() + wrapped.len());
        envelope.extend_from_slice(&signature_len.to_be_bytes());
        envelope.extend_from_slice(&signature);
        envelope.extend_from_slice(&wrapped);

        Ok(KeyWrapResult {
            wrapped_key: envelope,
            metadata: metadata.clone(),
        })
    }

    async fn unwrap_key(
        &self,
        wrapped_key: &[u8],
        metadata: &EncryptionKeyWrapMetadata,
    ) -> Result<KeyUnwrapResult, KeyWrapError> {
        if wrapped_key.is_empty() {
            return Err(KeyWrapError::ArgumentNull("wrapped_key"));
        }
        let algorithm = self.check_metadata(metadata)?;

        let (signature, wrapped) = split_envelope(wrapped_key).ok_or_else(|| {
            KeyWrapError::InvalidMetadata(format!("malformed wrapped key for {}", metadata.value))
        })?;

        if !self.provider.verify(&metadata.value, false, signature).await? {
            warn!(master_key = %metadata.value, "Master key metadata signature rejected");
            return Err(KeyWrapError::SignatureVerificationFailed(
                metadata.value.clone(),
            ));
        }

        let key = self.provider.unwrap_key(&metadata.value, algorithm, wrapped).await?;

        Ok(KeyUnwrapResult {
            key,
            client_cache_ttl: self.client_cache_ttl,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Shifts bytes by one; signatures are the path bytes.
    #[derive(Default)]
    struct ShiftingKeyStore {
        unwraps: AtomicUsize,
        reject_signatures: AtomicBool,
    }

    #[async_trait]
    impl KeyStoreProvider for ShiftingKeyStore {
        fn provider_name(&self) -> &str {
            "TEST_KEY_STORE"
        }

        async fn wrap_key(
            &self,
            _path: &str,
            _algorithm: KeyWrapAlgorithm,
            key: &[u8],
        ) -> Result<Vec<u8>, KeyWrapError> {
            Ok(key.iter().map(|b| b.wrapping_add(1)).collect())
        }

        async fn unwrap_key(
            &self,
            _path: &str,
            _algorithm: KeyWrapAlgorithm,
            wrapped_key: &[u8],
        ) -> Result<Zeroizing<Vec<u8>>, KeyWrapError> {
            self.unwraps.fetch_add(1, Ordering::SeqCst);
            Ok(Zeroizing::new(
                wrapped_key.iter().map(|b| b.wrapping_sub(1)).collect(),
            ))
        }

        async fn sign(&self, path: &str, _allow_enclave: bool) -> Result<Vec<u8>, KeyWrapError> {
            Ok(path.as_bytes().to_vec())
        }

        async fn verify(
            &self,
            path: &str,
            _allow_enclave: bool,
            signature: &[u8],
        ) -> Result<bool, KeyWrapError> {
            Ok(!self.reject_signatures.load(Ordering::SeqCst) && signature == path.as_bytes())
        }
    }

    fn metadata() -> EncryptionKeyWrapMetadata {
        EncryptionKeyWrapMetadata::new("TEST_KEY_STORE", "https://v/keys/cmk1")
            .with_name("cmk1")
            .with_algorithm("A256GCM")
    }

    #[tokio::test]
    async fn test_wrap_unwrap() {
        let store = Arc::new(ShiftingKeyStore::default());
        let provider = KeyStoreWrapProvider::new(store.clone())
            .with_client_cache_ttl(Duration::from_secs(5));

        let wrapped = provider.wrap_key(&[1, 2, 3], &metadata()).await.unwrap();
        assert_eq!(wrapped.metadata, metadata());
        assert_ne!(&wrapped.wrapped_key[..], &[1, 2, 3]);

        let unwrapped = provider.unwrap_key(&wrapped.wrapped_key, &metadata()).await.unwrap();
        assert_eq!(&*unwrapped.key, &[1, 2, 3]);
        assert_eq!(unwrapped.client_cache_ttl, Duration::from_secs(5));
        assert_eq!(store.unwraps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signature_checked_on_unwrap() {
        let store = Arc::new(ShiftingKeyStore::default());
        let provider = KeyStoreWrapProvider::new(store.clone());

        let wrapped = provider.wrap_key(&[7; 32], &metadata()).await.unwrap();
        store.reject_signatures.store(true, Ordering::SeqCst);

        let result = provider.unwrap_key(&wrapped.wrapped_key, &metadata()).await;
        assert!(matches!(result, Err(KeyWrapError::SignatureVerificationFailed(_))));
        assert_eq!(store.unwraps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let provider = KeyStoreWrapProvider::new(Arc::new(ShiftingKeyStore::default()));

        assert!(matches!(
            provider.wrap_key(&[], &metadata()).await,
            Err(KeyWrapError::ArgumentNull("key"))
        ));
        assert!(matches!(
            provider.unwrap_key(&[], &metadata()).await,
            Err(KeyWrapError::ArgumentNull("wrapped_key"))
        ));

        let wrong_type = EncryptionKeyWrapMetadata::new("keyvault", "https://v/keys/cmk1")
            .with_algorithm("A256GCM");
        assert!(matches!(
            provider.wrap_key(&[1], &wrong_type).await,
            Err(KeyWrapError::InvalidMetadata(_))
        ));

        let no_algorithm = EncryptionKeyWrapMetadata::new("TEST_KEY_STORE", "https://v/keys/cmk1");
        assert!(matches!(
            provider.wrap_key(&[1], &no_algorithm).await,
            Err(KeyWrapError::InvalidMetadata(_))
        ));

        let bad_algorithm = no_algorithm.with_algorithm("RSA-OAEP");
        assert!(matches!(
            provider.wrap_key(&[1], &bad_algorithm).await,
            Err(KeyWrapError::UnsupportedAlgorithm(_))
        ));

        assert!(matches!(
            provider.unwrap_key(&[0, 9, 1], &metadata()).await,
            Err(KeyWrapError::InvalidMetadata(_))
        ));
    }
}

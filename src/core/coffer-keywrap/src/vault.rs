//! Key wrap providers backed by a key vault.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coffer_keyvault::{KeyUri, KeyVaultClient, KeyVaultError, KeyWrapAlgorithm};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::KeyWrapError;
use crate::keystore::KeyStoreProvider;
use crate::metadata::EncryptionKeyWrapMetadata;
use crate::provider::{KeyUnwrapResult, KeyWrapProvider, KeyWrapResult, DEFAULT_CLIENT_CACHE_TTL};

/// Metadata type handled by [`VaultKeyWrapProvider`].
pub const KEY_VAULT_METADATA_TYPE: &str = "keyvault";

/// Provider name of [`VaultKeyStoreProvider`].
pub const KEY_VAULT_PROVIDER_NAME: &str = "COFFER_KEY_VAULT";

const ENVELOPE_VERSION: u8 = 0x01;

fn parse_uri(value: &str) -> Result<KeyUri, KeyWrapError> {
    value
        .parse()
        .map_err(|e: KeyVaultError| KeyWrapError::InvalidMetadata(e.to_string()))
}

// ============================================================================
// Legacy provider
// ============================================================================

/// Legacy wrap provider over a key vault.
///
/// Metadata of type `keyvault` carries a master key URI. Wrapping always
/// uses AES-256-GCM and returns metadata whose value is the versioned key
/// id that did the wrapping, so later unwraps survive key rotation.
pub struct VaultKeyWrapProvider {
    client: Arc<dyn KeyVaultClient>,
    client_cache_ttl: Duration,
}

impl VaultKeyWrapProvider {
    /// Creates a provider with the default cache TTL.
    pub fn new(client: Arc<dyn KeyVaultClient>) -> Self {
        Self {
            client,
            client_cache_ttl: DEFAULT_CLIENT_CACHE_TTL,
        }
    }

    /// Overrides how long unwrapped keys may be cached.
    pub fn with_client_cache_ttl(mut self, ttl: Duration) -> Self {
        self.client_cache_ttl = ttl;
        self
    }

    fn resolve(&self, metadata: &EncryptionKeyWrapMetadata) -> Result<KeyUri, KeyWrapError> {
        if metadata.type_ != KEY_VAULT_METADATA_TYPE {
            return Err(KeyWrapError::InvalidMetadata(format!(
                "expected metadata type {KEY_VAULT_METADATA_TYPE}, got {}",
                metadata.type_
            )));
        }
        match metadata.algorithm.as_deref() {
            None | Some("A256GCM") => {}
            Some(other) => return Err(KeyWrapError::UnsupportedAlgorithm(other.to_string())),
        }
        parse_uri(&metadata.value)
    }
}

#[async_trait]
impl KeyWrapProvider for VaultKeyWrapProvider {
    async fn wrap_key(
        &self,
        key: &[u8],
        metadata: &EncryptionKeyWrapMetadata,
    ) -> Result<KeyWrapResult, KeyWrapError> {
        if key.is_empty() {
            return Err(KeyWrapError::ArgumentNull("key"));
        }
        let uri = self.resolve(metadata)?;

        let result = self
            .client
            .wrap_key(&uri, KeyWrapAlgorithm::A256Gcm, key)
            .await
            .map_err(|e| KeyWrapError::from_vault(&metadata.value, e))?;

        debug!(kid = %result.kid, "Data encryption key wrapped");

        Ok(KeyWrapResult {
            wrapped_key: result.wrapped_key,
            metadata: EncryptionKeyWrapMetadata {
                type_: KEY_VAULT_METADATA_TYPE.to_string(),
                name: metadata.name.clone(),
                value: result.kid,
                algorithm: metadata.algorithm.clone(),
            },
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
        let uri = self.resolve(metadata)?;

        let result = self
            .client
            .unwrap_key(&uri, KeyWrapAlgorithm::A256Gcm, wrapped_key)
            .await
            .map_err(|e| KeyWrapError::from_vault(&metadata.value, e))?;

        Ok(KeyUnwrapResult {
            key: result.key,
            client_cache_ttl: self.client_cache_ttl,
        })
    }
}

// ============================================================================
// Key store provider
// ============================================================================

/// Key store provider over a key vault.
///
/// Master key paths are master key URIs. The wrapped form records the
/// versioned key id that wrapped: `0x01 || u16 BE id length || id || ciphertext`.
pub struct VaultKeyStoreProvider {
    client: Arc<dyn KeyVaultClient>,
    require_deletion_protection: bool,
}

impl VaultKeyStoreProvider {
    /// Creates a provider.
    pub fn new(client: Arc<dyn KeyVaultClient>) -> Self {
        Self {
            client,
            require_deletion_protection: false,
        }
    }

    /// Refuses to wrap under master keys that can be purged.
    pub fn with_deletion_protection_required(mut self, required: bool) -> Self {
        self.require_deletion_protection = required;
        self
    }

    fn signed_data(&self, master_key_path: &str, allow_enclave: bool) -> Vec<u8> {
        format!(
            "{}:{}:{}",
            KEY_VAULT_PROVIDER_NAME,
            master_key_path.to_lowercase(),
            allow_enclave
        )
        .into_bytes()
    }

    async fn check_deletion_protection(&self, uri: &KeyUri) -> Result<(), KeyWrapError> {
        if !self.require_deletion_protection {
            return Ok(());
        }

        let protected = self
            .client
            .validate_deletion_protection(uri)
            .await
            .map_err(|e| KeyWrapError::from_vault(&uri.to_string(), e))?;

        if protected {
            Ok(())
        } else {
            Err(KeyWrapError::DeletionProtectionRequired(uri.to_string()))
        }
    }
}

fn encode_envelope(kid: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeyWrapError> {
    let kid_len = u16::try_from(kid.len())
        .map_err(|_| KeyWrapError::InvalidMetadata(format!("key id too long: {kid}")))?;

    let mut envelope = Vec::with_capacity(3 + kid.len() + ciphertext.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(&kid_len.to_be_bytes());
    envelope.extend_from_slice(kid.as_bytes());
    envelope.extend_from_slice(ciphertext);
    Ok(envelope)
}

fn decode_envelope(envelope: &[u8]) -> Option<(&str, &[u8])> {
    let (&version, rest) = envelope.split_first()?;
    if version != ENVELOPE_VERSION {
        return None;
    }
    let (len, rest) = rest.split_first_chunk::<2>()?;
    let len = u16::from_be_bytes(*len) as usize;
    if rest.len() <= len {
        return None;
    }
    let (kid, ciphertext) = rest.split_at(len);
    Some((std::str::from_utf8(kid).ok()?, ciphertext))
}

#[async_trait]
impl KeyStoreProvider for VaultKeyStoreProvider {
    fn provider_name(&self) -> &str {
        KEY_VAULT_PROVIDER_NAME
    }

    async fn wrap_key(
        &self,
        master_key_path: &str,
        algorithm: KeyWrapAlgorithm,
        key: &[u8],
    ) -> Result<Vec<u8>, KeyWrapError> {
        if key.is_empty() {
            return Err(KeyWrapError::ArgumentNull("key"));
        }
        let uri = parse_uri(master_key_path)?;
        self.check_deletion_protection(&uri).await?;

        let result = self
            .client
            .wrap_key(&uri, algorithm, key)
            .await
            .map_err(|e| KeyWrapError::from_vault(master_key_path, e))?;

        debug!(kid = %result.kid, algorithm = %algorithm, "Data encryption key wrapped");

        encode_envelope(&result.kid, &result.wrapped_key)
    }

    async fn unwrap_key(
        &self,
        master_key_path: &str,
        algorithm: KeyWrapAlgorithm,
        wrapped_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeyWrapError> {
        if wrapped_key.is_empty() {
            return Err(KeyWrapError::ArgumentNull("wrapped_key"));
        }
        let uri = parse_uri(master_key_path)?;

        let (kid, ciphertext) = decode_envelope(wrapped_key).ok_or_else(|| {
            KeyWrapError::InvalidMetadata(format!("malformed wrapped key for {master_key_path}"))
        })?;
        let kid = parse_uri(kid)?;
        if kid.unversioned() != uri.unversioned() {
            return Err(KeyWrapError::InvalidMetadata(format!(
                "wrapped key belongs to {kid}, not {uri}"
            )));
        }

        let result = self
            .client
            .unwrap_key(&kid, algorithm, ciphertext)
            .await
            .map_err(|e| KeyWrapError::from_vault(master_key_path, e))?;

        Ok(result.key)
    }

    async fn sign(
        &self,
        master_key_path: &str,
        allow_enclave: bool,
    ) -> Result<Vec<u8>, KeyWrapError> {
        let uri = parse_uri(master_key_path)?;
        let data = self.signed_data(master_key_path, allow_enclave);

        let result = self
            .client
            .sign(&uri.unversioned(), &data)
            .await
            .map_err(|e| KeyWrapError::from_vault(master_key_path, e))?;

        Ok(result.signature)
    }

    async fn verify(
        &self,
        master_key_path: &str,
        allow_enclave: bool,
        signature: &[u8],
    ) -> Result<bool, KeyWrapError> {
        let uri = parse_uri(master_key_path)?;
        let data = self.signed_data(master_key_path, allow_enclave);

        self.client
            .verify(&uri.unversioned(), &data, signature)
            .await
            .map_err(|e| KeyWrapError::from_vault(master_key_path, e))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::keystore::KeyStoreWrapProvider;
    use coffer_crypto::MasterKey;
    use coffer_keyvault::{KeyOptions, KeyType, LocalKeyVault};
    use coffer_storage_sqlite::SqliteBackend;
    use tempfile::TempDir;

    const VAULT: &str = "https://vault.test";

    async fn setup() -> (TempDir, Arc<LocalKeyVault>) {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(SqliteBackend::open(tmp.path(), "vault").await.unwrap());
        let vault = Arc::new(LocalKeyVault::new(storage, MasterKey::generate(), VAULT));
        vault.create_key("cmk1", KeyOptions::default()).await.unwrap();
        (tmp, vault)
    }

    fn legacy_metadata() -> EncryptionKeyWrapMetadata {
        EncryptionKeyWrapMetadata::new(KEY_VAULT_METADATA_TYPE, format!("{VAULT}/keys/cmk1"))
    }

    #[tokio::test]
    async fn test_legacy_wrap_renames_metadata() {
        let (_tmp, vault) = setup().await;
        let provider = VaultKeyWrapProvider::new(vault.clone());

        let wrapped = provider.wrap_key(&[5; 32], &legacy_metadata()).await.unwrap();
        assert_eq!(wrapped.metadata.value, format!("{VAULT}/keys/cmk1/1"));
        assert_ne!(wrapped.metadata, legacy_metadata());

        vault.rotate_key("cmk1").await.unwrap();

        let unwrapped = provider
            .unwrap_key(&wrapped.wrapped_key, &wrapped.metadata)
            .await
            .unwrap();
        assert_eq!(&*unwrapped.key, &[5; 32]);
        assert_eq!(unwrapped.client_cache_ttl, DEFAULT_CLIENT_CACHE_TTL);
    }

    #[tokio::test]
    async fn test_legacy_rejects_bad_metadata() {
        let (_tmp, vault) = setup().await;
        let provider = VaultKeyWrapProvider::new(vault);

        let wrong_type = EncryptionKeyWrapMetadata::new("other", format!("{VAULT}/keys/cmk1"));
        assert!(matches!(
            provider.wrap_key(&[1], &wrong_type).await,
            Err(KeyWrapError::InvalidMetadata(_))
        ));

        let malformed = EncryptionKeyWrapMetadata::new(KEY_VAULT_METADATA_TYPE, "not-a-uri");
        assert!(matches!(
            provider.wrap_key(&[1], &malformed).await,
            Err(KeyWrapError::InvalidMetadata(_))
        ));

        let missing =
            EncryptionKeyWrapMetadata::new(KEY_VAULT_METADATA_TYPE, format!("{VAULT}/keys/nope"));
        assert!(matches!(
            provider.wrap_key(&[1], &missing).await,
            Err(KeyWrapError::InvalidMetadata(_))
        ));

        let chacha = legacy_metadata().with_algorithm("C20P");
        assert!(matches!(
            provider.wrap_key(&[1], &chacha).await,
            Err(KeyWrapError::UnsupportedAlgorithm(_))
        ));

        assert!(matches!(
            provider.wrap_key(&[], &legacy_metadata()).await,
            Err(KeyWrapError::ArgumentNull(_))
        ));
    }

    #[tokio::test]
    async fn test_vault_outage_is_access_error() {
        let (_tmp, vault) = setup().await;
        let provider = VaultKeyWrapProvider::new(vault.clone());

        vault.set_online(false);
        let result = provider.wrap_key(&[1; 32], &legacy_metadata()).await;
        assert!(matches!(
            result,
            Err(KeyWrapError::Access {
                source: KeyVaultError::ServiceUnavailable(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_key_store_survives_rotation() {
        let (_tmp, vault) = setup().await;
        vault
            .create_key(
                "cmk-chacha",
                KeyOptions {
                    key_type: KeyType::ChaCha20Poly1305,
                    ..KeyOptions::default()
                },
            )
            .await
            .unwrap();

        let provider = KeyStoreWrapProvider::new(Arc::new(VaultKeyStoreProvider::new(vault.clone())));
        let metadata = EncryptionKeyWrapMetadata::new(
            KEY_VAULT_PROVIDER_NAME,
            format!("{VAULT}/keys/cmk-chacha"),
        )
        .with_algorithm("C20P");

        let wrapped = provider.wrap_key(&[9; 32], &metadata).await.unwrap();
        assert_eq!(wrapped.metadata, metadata);

        vault.rotate_key("cmk-chacha").await.unwrap();

        let unwrapped = provider.unwrap_key(&wrapped.wrapped_key, &metadata).await.unwrap();
        assert_eq!(&*unwrapped.key, &[9; 32]);
    }

    #[tokio::test]
    async fn test_key_store_rejects_foreign_envelope() {
        let (_tmp, vault) = setup().await;
        vault.create_key("cmk2", KeyOptions::default()).await.unwrap();
        let store = VaultKeyStoreProvider::new(vault);

        let path1 = format!("{VAULT}/keys/cmk1");
        let path2 = format!("{VAULT}/keys/cmk2");
        let wrapped = store
            .wrap_key(&path1, KeyWrapAlgorithm::A256Gcm, &[3; 32])
            .await
            .unwrap();

        let result = store
            .unwrap_key(&path2, KeyWrapAlgorithm::A256Gcm, &wrapped)
            .await;
        assert!(matches!(result, Err(KeyWrapError::InvalidMetadata(_))));
    }

    #[tokio::test]
    async fn test_key_store_sign_verify() {
        let (_tmp, vault) = setup().await;
        let store = VaultKeyStoreProvider::new(vault);
        let path = format!("{VAULT}/keys/cmk1");

        let signature = store.sign(&path, false).await.unwrap();
        assert!(store.verify(&path, false, &signature).await.unwrap());
        assert!(!store.verify(&path, true, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_deletion_protection_required() {
        let (_tmp, vault) = setup().await;
        vault
            .create_key(
                "purgeable",
                KeyOptions {
                    recovery_level: Some("Purgeable".into()),
                    ..KeyOptions::default()
                },
            )
            .await
            .unwrap();

        let store = VaultKeyStoreProvider::new(vault).with_deletion_protection_required(true);

        let result = store
            .wrap_key(&format!("{VAULT}/keys/purgeable"), KeyWrapAlgorithm::A256Gcm, &[1; 32])
            .await;
        assert!(matches!(result, Err(KeyWrapError::DeletionProtectionRequired(_))));

        assert!(store
            .wrap_key(&format!("{VAULT}/keys/cmk1"), KeyWrapAlgorithm::A256Gcm, &[1; 32])
            .await
            .is_ok());
    }
}

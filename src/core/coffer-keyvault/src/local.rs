//! Local key vault.
//!
//! Keeps versioned master keys in a [`StorageBackend`]. Each version's key
//! material is encrypted at rest under a key derived from the vault root
//! key with info `coffer-vault-v1:{name}:{version}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use coffer_crypto::{aead, kdf, random, AeadCipher, MasterKey};
use coffer_storage::StorageBackend;

use crate::client::{
    KeyAttributes, KeyType, KeyVaultClient, KeyVaultKey, KeyWrapAlgorithm, SignResult,
    UnwrapResult, WrapResult,
};
use crate::error::KeyVaultError;
use crate::uri::KeyUri;

const SIGNING_KEY_INFO: &[u8] = b"coffer-vault-v1:sign";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    name: String,
    key_type: KeyType,
    latest_version: u32,
    enabled: bool,
    recovery_level: Option<String>,
    created_at: u64,
    updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    version: u32,
    key_material: String,
    created_at: u64,
}

/// Options for creating a master key.
#[derive(Debug, Clone)]
pub struct KeyOptions {
    /// Key type (default: AES-256-GCM).
    pub key_type: KeyType,
    /// Recovery level reported by the vault (default: `Recoverable`).
    pub recovery_level: Option<String>,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            key_type: KeyType::default(),
            recovery_level: Some("Recoverable".to_string()),
        }
    }
}

/// A key vault running in-process.
pub struct LocalKeyVault {
    storage: Arc<dyn StorageBackend>,
    master_key: MasterKey,
    vault_url: String,
    online: AtomicBool,
}

impl LocalKeyVault {
    /// Creates a vault over `storage`, answering for keys under `vault_url`.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        master_key: MasterKey,
        vault_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            master_key,
            vault_url: vault_url.into().trim_end_matches('/').to_string(),
            online: AtomicBool::new(true),
        }
    }

    /// Base URL of this vault.
    pub fn vault_url(&self) -> &str {
        &self.vault_url
    }

    /// Unversioned URI of the named key.
    pub fn key_uri(&self, name: &str) -> KeyUri {
        KeyUri::new(&self.vault_url, name, None)
    }

    /// Takes the vault offline or back online.
    ///
    /// While offline every operation fails with
    /// [`KeyVaultError::ServiceUnavailable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn validate_name(name: &str) -> Result<(), KeyVaultError> {
        if name.is_empty() {
            return Err(KeyVaultError::InvalidKeyName("name cannot be empty".into()));
        }
        if name.len() > 128 {
            return Err(KeyVaultError::InvalidKeyName(
                "name too long (max 128 chars)".into(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(KeyVaultError::InvalidKeyName(
                "name can only contain alphanumeric, dash, underscore".into(),
            ));
        }
        Ok(())
    }

    fn record_key(name: &str) -> String {
        format!("keys/{name}")
    }

    fn version_key(name: &str, version: u32) -> String {
        format!("key-versions/{name}/{version}")
    }

    fn ensure_online(&self) -> Result<(), KeyVaultError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KeyVaultError::ServiceUnavailable(format!(
                "vault {} is offline",
                self.vault_url
            )))
        }
    }

    fn material_aad(name: &str, version: u32) -> String {
        format!("coffer-vault-v1:{name}:{version}")
    }

    fn encrypt_material(
        &self,
        name: &str,
        version: u32,
        material: &[u8],
    ) -> Result<String, KeyVaultError> {
        let info = Self::material_aad(name, version);
        let wrapping_key = kdf::derive_subkey(self.master_key.as_bytes(), info.as_bytes())?;
        let ciphertext =
            aead::seal(AeadCipher::Aes256Gcm, wrapping_key.as_slice(), material, info.as_bytes())?;
        Ok(BASE64.encode(ciphertext))
    }

    fn decrypt_material(
        &self,
        name: &str,
        version: u32,
        encoded: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KeyVaultError> {
        let info = Self::material_aad(name, version);
        let wrapping_key = kdf::derive_subkey(self.master_key.as_bytes(), info.as_bytes())?;
        let ciphertext = BASE64
            .decode(encoded)
            .map_err(|e| KeyVaultError::Storage(format!("corrupt key material: {e}")))?;
        Ok(aead::open(
            AeadCipher::Aes256Gcm,
            wrapping_key.as_slice(),
            &ciphertext,
            info.as_bytes(),
        )?)
    }

    async fn load_record(&self, name: &str) -> Result<KeyRecord, KeyVaultError> {
        let bytes = self
            .storage
            .get(&Self::record_key(name))
            .await?
            .ok_or_else(|| KeyVaultError::KeyNotFound(name.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| KeyVaultError::Storage(e.to_string()))
    }

    async fn store_record(&self, record: &KeyRecord) -> Result<(), KeyVaultError> {
        let bytes = serde_json::to_vec(record).map_err(|e| KeyVaultError::Storage(e.to_string()))?;
        self.storage.put(&Self::record_key(&record.name), &bytes).await?;
        Ok(())
    }

    /// Stores fresh material as `version` unless that version is taken.
    async fn claim_version(&self, name: &str, version: u32) -> Result<bool, KeyVaultError> {
        let material = random::generate_key();
        let record = VersionRecord {
            version,
            key_material: self.encrypt_material(name, version, material.as_slice())?,
            created_at: Self::now(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| KeyVaultError::Storage(e.to_string()))?;
        Ok(self.storage.insert(&Self::version_key(name, version), &bytes).await?)
    }

    async fn load_material(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Zeroizing<Vec<u8>>, KeyVaultError> {
        let bytes = self
            .storage
            .get(&Self::version_key(name, version))
            .await?
            .ok_or_else(|| KeyVaultError::KeyNotFound(format!("{name} v{version}")))?;
        let record: VersionRecord =
            serde_json::from_slice(&bytes).map_err(|e| KeyVaultError::Storage(e.to_string()))?;
        self.decrypt_material(name, record.version, &record.key_material)
    }

    /// Resolves a URI to its key record and version.
    async fn resolve(&self, uri: &KeyUri) -> Result<(KeyRecord, u32), KeyVaultError> {
        self.ensure_online()?;

        if uri.vault() != self.vault_url {
            return Err(KeyVaultError::InvalidKeyUri(format!(
                "{uri} does not belong to vault {}",
                self.vault_url
            )));
        }

        let record = self.load_record(uri.name()).await?;
        let version = match uri.version() {
            Some(v) => {
                let version = v
                    .parse::<u32>()
                    .ok()
                    .filter(|v| *v >= 1)
                    .ok_or_else(|| KeyVaultError::KeyNotFound(uri.to_string()))?;
                // Versions past the record's latest exist while a rotation lands
                if version > record.latest_version
                    && self.storage.get(&Self::version_key(&record.name, version)).await?.is_none()
                {
                    return Err(KeyVaultError::KeyNotFound(uri.to_string()));
                }
                version
            }
            None => record.latest_version,
        };

        Ok((record, version))
    }

    fn check_enabled(record: &KeyRecord) -> Result<(), KeyVaultError> {
        if record.enabled {
            Ok(())
        } else {
            Err(KeyVaultError::KeyDisabled(record.name.clone()))
        }
    }

    fn check_algorithm(record: &KeyRecord, algorithm: KeyWrapAlgorithm) -> Result<(), KeyVaultError> {
        if record.key_type.wrap_algorithm() == algorithm {
            Ok(())
        } else {
            Err(KeyVaultError::UnsupportedAlgorithm {
                algorithm: algorithm.to_string(),
                key_type: record.key_type.to_string(),
            })
        }
    }

    fn describe(&self, record: &KeyRecord, version: u32) -> KeyVaultKey {
        KeyVaultKey {
            kid: self.key_uri(&record.name).with_version(version.to_string()).to_string(),
            key_type: record.key_type,
            attributes: KeyAttributes {
                enabled: record.enabled,
                recovery_level: record.recovery_level.clone(),
                created: record.created_at,
                updated: record.updated_at,
            },
        }
    }

    fn signing_mac(material: &[u8]) -> Result<Hmac<Sha256>, KeyVaultError> {
        let signing_key = kdf::derive_subkey(material, SIGNING_KEY_INFO)?;
        <Hmac<Sha256> as Mac>::new_from_slice(signing_key.as_slice())
            .map_err(|e| KeyVaultError::Storage(e.to_string()))
    }

    // ========================================================================
    // Key Management Operations
    // ========================================================================

    /// Creates a master key with its first version.
    pub async fn create_key(
        &self,
        name: &str,
        options: KeyOptions,
    ) -> Result<KeyVaultKey, KeyVaultError> {
        self.ensure_online()?;
        Self::validate_name(name)?;

        if self.storage.get(&Self::record_key(name)).await?.is_some()
            || !self.claim_version(name, 1).await?
        {
            return Err(KeyVaultError::KeyExists(name.to_string()));
        }

        let now = Self::now();

        let record = KeyRecord {
            name: name.to_string(),
            key_type: options.key_type,
            latest_version: 1,
            enabled: true,
            recovery_level: options.recovery_level,
            created_at: now,
            updated_at: now,
        };
        self.store_record(&record).await?;

        info!(name = name, key_type = %record.key_type, "Master key created");

        Ok(self.describe(&record, 1))
    }

    /// Adds a new version to a master key. Older versions stay usable for unwrap.
    pub async fn rotate_key(&self, name: &str) -> Result<KeyVaultKey, KeyVaultError> {
        self.ensure_online()?;
        let record = self.load_record(name).await?;

        // A concurrent rotation may have claimed the next version
        let mut version = record.latest_version + 1;
        while !self.claim_version(name, version).await? {
            version += 1;
        }

        let mut record = self.load_record(name).await?;
        record.latest_version = record.latest_version.max(version);
        record.updated_at = Self::now();
        self.store_record(&record).await?;

        info!(name = name, version = version, "Master key rotated");

        Ok(self.describe(&record, version))
    }

    /// Enables or disables a master key.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), KeyVaultError> {
        self.ensure_online()?;
        let mut record = self.load_record(name).await?;
        record.enabled = enabled;
        record.updated_at = Self::now();
        self.store_record(&record).await?;

        info!(name = name, enabled = enabled, "Master key updated");
        Ok(())
    }

    /// Lists master key names.
    pub async fn list_keys(&self) -> Result<Vec<String>, KeyVaultError> {
        self.ensure_online()?;
        let keys = self.storage.list("keys/").await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("keys/").map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl KeyVaultClient for LocalKeyVault {
    async fn get_key(&self, uri: &KeyUri) -> Result<KeyVaultKey, KeyVaultError> {
        let (record, version) = self.resolve(uri).await?;
        Ok(self.describe(&record, version))
    }

    async fn wrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        key: &[u8],
    ) -> Result<WrapResult, KeyVaultError> {
        if key.is_empty() {
            return Err(KeyVaultError::WrapUnwrapFailure("key to wrap is empty".into()));
        }

        let (record, version) = self.resolve(uri).await?;
        Self::check_enabled(&record)?;
        Self::check_algorithm(&record, algorithm)?;

        let material = self.load_material(&record.name, version).await?;
        let aad = Self::material_aad(&record.name, version);
        let wrapped_key = aead::seal(record.key_type.cipher(), &material, key, aad.as_bytes())?;

        debug!(name = %record.name, version = version, "Key wrapped");

        Ok(WrapResult {
            kid: self.describe(&record, version).kid,
            wrapped_key,
        })
    }

    async fn unwrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        wrapped_key: &[u8],
    ) -> Result<UnwrapResult, KeyVaultError> {
        if wrapped_key.is_empty() {
            return Err(KeyVaultError::WrapUnwrapFailure("wrapped key is empty".into()));
        }

        let (record, version) = self.resolve(uri).await?;
        Self::check_enabled(&record)?;
        Self::check_algorithm(&record, algorithm)?;

        let material = self.load_material(&record.name, version).await?;
        let aad = Self::material_aad(&record.name, version);
        let key = aead::open(record.key_type.cipher(), &material, wrapped_key, aad.as_bytes())
            .map_err(|_| KeyVaultError::WrapUnwrapFailure(format!("unwrap failed for {uri}")))?;

        debug!(name = %record.name, version = version, "Key unwrapped");

        Ok(UnwrapResult {
            kid: self.describe(&record, version).kid,
            key,
        })
    }

    async fn sign(&self, uri: &KeyUri, data: &[u8]) -> Result<SignResult, KeyVaultError> {
        let (record, version) = self.resolve(uri).await?;
        Self::check_enabled(&record)?;

        let material = self.load_material(&record.name, version).await?;
        let mut mac = Self::signing_mac(&material)?;
        mac.update(data);

        Ok(SignResult {
            kid: self.describe(&record, version).kid,
            signature: mac.finalize().into_bytes().to_vec(),
        })
    }

    /// Without a pinned version, a signature from any version is accepted.
    async fn verify(
        &self,
        uri: &KeyUri,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyVaultError> {
        let (record, version) = self.resolve(uri).await?;
        Self::check_enabled(&record)?;

        let candidates = match uri.version() {
            Some(_) => version..=version,
            None => 1..=record.latest_version,
        };

        for candidate in candidates.rev() {
            let material = self.load_material(&record.name, candidate).await?;
            let mut mac = Self::signing_mac(&material)?;
            mac.update(data);
            if mac.verify_slice(signature).is_ok() {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

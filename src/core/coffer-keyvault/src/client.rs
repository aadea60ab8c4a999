//! Key vault client contract.

use std::str::FromStr;

use async_trait::async_trait;
use coffer_crypto::AeadCipher;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::KeyVaultError;
use crate::uri::KeyUri;

/// Recovery levels under which a deleted key can neither be purged nor lost.
pub const PROTECTED_RECOVERY_LEVELS: &[&str] = &[
    "Recoverable",
    "Recoverable+ProtectedSubscription",
    "CustomizedRecoverable",
    "CustomizedRecoverable+ProtectedSubscription",
];

/// Type of a master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyType {
    /// AES-256-GCM (default).
    #[default]
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
    /// ChaCha20-Poly1305.
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl KeyType {
    /// The only wrap algorithm a key of this type accepts.
    pub fn wrap_algorithm(self) -> KeyWrapAlgorithm {
        match self {
            Self::Aes256Gcm => KeyWrapAlgorithm::A256Gcm,
            Self::ChaCha20Poly1305 => KeyWrapAlgorithm::ChaCha20Poly1305,
        }
    }

    /// Cipher sealing data under a key of this type.
    pub fn cipher(self) -> AeadCipher {
        match self {
            Self::Aes256Gcm => AeadCipher::Aes256Gcm,
            Self::ChaCha20Poly1305 => AeadCipher::ChaCha20Poly1305,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aes256Gcm => write!(f, "aes256-gcm"),
            Self::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
        }
    }
}

impl FromStr for KeyType {
    type Err = KeyVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            _ => Err(KeyVaultError::UnsupportedAlgorithm {
                algorithm: s.to_string(),
                key_type: "unknown".to_string(),
            }),
        }
    }
}

/// Key-encryption algorithm used to wrap a data encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyWrapAlgorithm {
    /// AES-256-GCM.
    #[serde(rename = "A256GCM")]
    A256Gcm,
    /// ChaCha20-Poly1305.
    #[serde(rename = "C20P")]
    ChaCha20Poly1305,
}

impl KeyWrapAlgorithm {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A256Gcm => "A256GCM",
            Self::ChaCha20Poly1305 => "C20P",
        }
    }
}

impl std::fmt::Display for KeyWrapAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyWrapAlgorithm {
    type Err = KeyVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A256GCM" => Ok(Self::A256Gcm),
            "C20P" => Ok(Self::ChaCha20Poly1305),
            _ => Err(KeyVaultError::UnsupportedAlgorithm {
                algorithm: s.to_string(),
                key_type: "any".to_string(),
            }),
        }
    }
}

/// Attributes of a master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAttributes {
    /// Whether the key can be used.
    pub enabled: bool,
    /// Deletion recovery level, e.g. `Recoverable+Purgeable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_level: Option<String>,
    /// Creation timestamp (Unix seconds).
    pub created: u64,
    /// Last update timestamp (Unix seconds).
    pub updated: u64,
}

/// A master key as described by the vault. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVaultKey {
    /// Versioned key identifier.
    pub kid: String,
    /// Key type.
    #[serde(rename = "kty")]
    pub key_type: KeyType,
    /// Key attributes.
    pub attributes: KeyAttributes,
}

/// Result of a wrap operation.
#[derive(Debug, Clone)]
pub struct WrapResult {
    /// Versioned identifier of the key that wrapped.
    pub kid: String,
    /// Wrapped key bytes.
    pub wrapped_key: Vec<u8>,
}

/// Result of an unwrap operation.
pub struct UnwrapResult {
    /// Versioned identifier of the key that unwrapped.
    pub kid: String,
    /// Raw key bytes.
    pub key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for UnwrapResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwrapResult")
            .field("kid", &self.kid)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Result of a sign operation.
#[derive(Debug, Clone)]
pub struct SignResult {
    /// Versioned identifier of the signing key.
    pub kid: String,
    /// Signature bytes.
    pub signature: Vec<u8>,
}

/// Client of an external key vault.
///
/// Operations address keys by [`KeyUri`]; an unversioned URI means the
/// latest version.
#[async_trait]
pub trait KeyVaultClient: Send + Sync {
    /// Describes a key.
    async fn get_key(&self, uri: &KeyUri) -> Result<KeyVaultKey, KeyVaultError>;

    /// Wraps `key` under the master key.
    async fn wrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        key: &[u8],
    ) -> Result<WrapResult, KeyVaultError>;

    /// Unwraps a key previously wrapped under the master key.
    async fn unwrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        wrapped_key: &[u8],
    ) -> Result<UnwrapResult, KeyVaultError>;

    /// Signs `data` with the master key.
    async fn sign(&self, uri: &KeyUri, data: &[u8]) -> Result<SignResult, KeyVaultError>;

    /// Verifies a signature produced by [`KeyVaultClient::sign`].
    async fn verify(
        &self,
        uri: &KeyUri,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyVaultError>;

    /// Checks that the key is protected against purge.
    ///
    /// Returns `Ok(false)` when the key has a recovery level that allows
    /// purging, and [`KeyVaultError::NullResult`] when the vault reports no
    /// recovery level at all.
    async fn validate_deletion_protection(&self, uri: &KeyUri) -> Result<bool, KeyVaultError> {
        let key = self.get_key(uri).await?;
        let level = key
            .attributes
            .recovery_level
            .ok_or_else(|| KeyVaultError::NullResult(format!("recovery level of {uri}")))?;

        Ok(PROTECTED_RECOVERY_LEVELS.contains(&level.as_str()))
    }
}

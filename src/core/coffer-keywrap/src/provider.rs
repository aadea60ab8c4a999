//! Legacy key wrap provider contract.

use std::time::Duration;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::KeyWrapError;
use crate::metadata::EncryptionKeyWrapMetadata;

/// How long unwrapped keys may be cached when the provider does not say.
pub const DEFAULT_CLIENT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Result of wrapping a key.
#[derive(Debug, Clone)]
pub struct KeyWrapResult {
    /// Wrapped key bytes.
    pub wrapped_key: Vec<u8>,
    /// Metadata to persist alongside the wrapped key. May differ from the
    /// metadata passed in.
    pub metadata: EncryptionKeyWrapMetadata,
}

/// Result of unwrapping a key.
pub struct KeyUnwrapResult {
    /// Raw key bytes.
    pub key: Zeroizing<Vec<u8>>,
    /// How long the raw key may stay cached. Zero disables caching.
    pub client_cache_ttl: Duration,
}

impl std::fmt::Debug for KeyUnwrapResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyUnwrapResult")
            .field("key", &"[REDACTED]")
            .field("client_cache_ttl", &self.client_cache_ttl)
            .finish()
    }
}

/// Wraps and unwraps data encryption keys under a master key.
#[async_trait]
pub trait KeyWrapProvider: Send + Sync {
    /// Wraps `key` under the master key identified by `metadata`.
    async fn wrap_key(
        &self,
        key: &[u8],
        metadata: &EncryptionKeyWrapMetadata,
    ) -> Result<KeyWrapResult, KeyWrapError>;

    /// Unwraps a key produced by [`KeyWrapProvider::wrap_key`].
    async fn unwrap_key(
        &self,
        wrapped_key: &[u8],
        metadata: &EncryptionKeyWrapMetadata,
    ) -> Result<KeyUnwrapResult, KeyWrapError>;
}

//! Flat key-value store behind the local key vault.

use async_trait::async_trait;

use crate::error::StorageError;

/// Byte values under string keys.
///
/// Keys are `/`-separated paths; [`list`](Self::list) matches on a plain
/// prefix.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Writes `value` under `key` unless the key is taken.
    ///
    /// Returns `false`, leaving the stored value alone, when it is.
    async fn insert(&self, key: &str, value: &[u8]) -> Result<bool, StorageError>;

    /// Lists the keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

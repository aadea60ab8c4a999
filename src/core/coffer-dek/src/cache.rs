//! In-memory DEK cache.
//!
//! Two maps: DEK records (short TTL, refreshed on read and rewrap) and raw
//! unwrapped keys (TTL given by the wrap provider or an override). Raw key
//! lookups are single-flight per DEK id: concurrent callers for the same id
//! wait on one unwrap instead of issuing their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use zeroize::Zeroizing;

use crate::properties::DataEncryptionKeyProperties;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct DekCacheConfig {
    /// Overrides the TTL returned by the wrap provider. Zero disables raw
    /// key caching.
    pub raw_dek_ttl_override: Option<Duration>,
    /// How long DEK records stay cached.
    pub properties_ttl: Duration,
    /// Interval of the background sweep. `None` disables it.
    pub cleanup_interval: Option<Duration>,
    /// Grace period after expiry before the sweep drops a raw key.
    pub cleanup_buffer: Duration,
}

impl Default for DekCacheConfig {
    fn default() -> Self {
        Self {
            raw_dek_ttl_override: None,
            properties_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Some(Duration::from_secs(60)),
            cleanup_buffer: Duration::ZERO,
        }
    }
}

struct RawKeyEntry {
    key: Zeroizing<Vec<u8>>,
    expires_at: Instant,
}

struct CachedProperties {
    properties: DataEncryptionKeyProperties,
    expires_at: Instant,
}

type RawKeySlot = Arc<tokio::sync::Mutex<Option<RawKeyEntry>>>;

/// DEK record and raw key cache.
pub struct DekCache {
    properties_ttl: Duration,
    properties: Mutex<HashMap<String, CachedProperties>>,
    raw_keys: Mutex<HashMap<String, RawKeySlot>>,
}

impl DekCache {
    /// Creates an empty cache.
    pub fn new(properties_ttl: Duration) -> Self {
        Self {
            properties_ttl,
            properties: Mutex::new(HashMap::new()),
            raw_keys: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // DEK records
    // ========================================================================

    /// Returns the cached record if it has not expired.
    pub fn get_properties(&self, id: &str) -> Option<DataEncryptionKeyProperties> {
        let map = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.properties.clone())
    }

    /// Caches a record.
    pub fn set_properties(&self, properties: DataEncryptionKeyProperties) {
        if self.properties_ttl.is_zero() {
            return;
        }
        let mut map = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            properties.id.clone(),
            CachedProperties {
                properties,
                expires_at: Instant::now() + self.properties_ttl,
            },
        );
    }

    // ========================================================================
    // Raw keys
    // ========================================================================

    /// Returns the raw key for `id`, calling `fetch` on a miss.
    ///
    /// `fetch` returns the raw key and how long it may be cached. Only one
    /// `fetch` runs at a time per id.
    pub async fn get_or_add_raw_key<F, Fut, E>(
        &self,
        id: &str,
        fetch: F,
    ) -> Result<Zeroizing<Vec<u8>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Zeroizing<Vec<u8>>, Duration), E>>,
    {
        let slot = {
            let mut map = self.raw_keys.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(id.to_string()).or_default().clone()
        };

        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref() {
            if cached.expires_at > Instant::now() {
                debug!(id = id, "Raw key cache hit");
                return Ok(cached.key.clone());
            }
        }

        debug!(id = id, "Raw key cache miss");
        let (key, ttl) = fetch().await?;

        *entry = if ttl.is_zero() {
            None
        } else {
            Some(RawKeyEntry {
                key: key.clone(),
                expires_at: Instant::now() + ttl,
            })
        };

        Ok(key)
    }

    /// Drops the raw key of `id`.
    pub fn remove_raw_key(&self, id: &str) {
        let mut map = self.raw_keys.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(id);
    }

    /// Drops everything cached for `id`.
    pub fn remove(&self, id: &str) {
        self.remove_raw_key(id);
        let mut map = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(id);
    }

    /// Number of cached raw keys, expired or not.
    pub fn raw_key_count(&self) -> usize {
        let map = self.raw_keys.lock().unwrap_or_else(PoisonError::into_inner);
        map.len()
    }

    /// Number of cached records, expired or not.
    pub fn properties_count(&self) -> usize {
        let map = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        map.len()
    }

    /// Drops records and raw keys that expired more than `buffer` ago.
    /// Returns how many entries were dropped.
    ///
    /// Raw key slots that are locked or shared with an in-flight lookup are
    /// left alone.
    pub fn sweep(&self, buffer: Duration) -> usize {
        let now = Instant::now();

        let properties_removed = {
            let mut map = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            map.retain(|_, entry| entry.expires_at + buffer > now);
            before - map.len()
        };

        let mut map = self.raw_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();

        map.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry
                    .as_ref()
                    .is_some_and(|cached| cached.expires_at + buffer > now),
                Err(_) => true,
            }
        });

        let raw_keys_removed = before - map.len();
        if raw_keys_removed + properties_removed > 0 {
            debug!(raw_keys_removed, properties_removed, "Expired cache entries swept");
        }
        raw_keys_removed + properties_removed
    }

    /// Starts the background sweep. The task stops once the cache is dropped.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration, buffer: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep(buffer);
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fetcher(
        calls: &AtomicUsize,
        ttl: Duration,
    ) -> impl Future<Output = Result<(Zeroizing<Vec<u8>>, Duration), Infallible>> + '_ {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok((Zeroizing::new(vec![7u8; 32]), ttl))
        }
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let cache = DekCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let key = cache
                .get_or_add_raw_key("dek1", || fetcher(&calls, Duration::from_secs(60)))
                .await
                .unwrap();
            assert_eq!(&*key, &[7u8; 32]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_caches() {
        let cache = DekCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_add_raw_key("dek1", || fetcher(&calls, Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = DekCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let (cache, calls) = (&cache, &calls);
        let lookups = (0..8).map(move |_| {
            cache.get_or_add_raw_key("dek1", move || fetcher(calls, Duration::from_secs(60)))
        });
        let results = futures::future::join_all(lookups).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_and_sweep() {
        let cache = Arc::new(DekCache::new(Duration::from_secs(60)));
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_millis(100);

        cache
            .get_or_add_raw_key("dek1", || fetcher(&calls, ttl))
            .await
            .unwrap();

        // Fresh entries survive a sweep
        assert_eq!(cache.sweep(Duration::ZERO), 0);
        assert_eq!(cache.raw_key_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.sweep(Duration::from_secs(10)), 0);
        assert_eq!(cache.sweep(Duration::ZERO), 1);
        assert_eq!(cache.raw_key_count(), 0);

        cache
            .get_or_add_raw_key("dek1", || fetcher(&calls, ttl))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_background_cleanup() {
        let cache = Arc::new(DekCache::new(Duration::from_secs(60)));
        let calls = AtomicUsize::new(0);

        cache
            .get_or_add_raw_key("dek1", || fetcher(&calls, Duration::from_millis(50)))
            .await
            .unwrap();

        let handle = cache.start_cleanup(Duration::from_millis(25), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.raw_key_count(), 0);

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = DekCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        cache
            .get_or_add_raw_key("dek1", || fetcher(&calls, Duration::from_secs(60)))
            .await
            .unwrap();
        cache.remove_raw_key("dek1");
        cache
            .get_or_add_raw_key("dek1", || fetcher(&calls, Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn record(id: &str) -> DataEncryptionKeyProperties {
        DataEncryptionKeyProperties::new(
            id,
            coffer_crypto::EncryptionAlgorithm::LegacyAeadAes256Gcm,
            vec![1],
            coffer_keywrap::EncryptionKeyWrapMetadata::new("keyvault", "v"),
            0,
        )
    }

    #[test]
    fn test_properties_zero_ttl() {
        let cache = DekCache::new(Duration::ZERO);
        cache.set_properties(record("dek1"));
        assert!(cache.get_properties("dek1").is_none());
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_properties() {
        let cache = DekCache::new(Duration::from_millis(100));
        cache.set_properties(record("dek1"));
        cache.set_properties(record("dek2"));

        assert_eq!(cache.sweep(Duration::ZERO), 0);
        assert_eq!(cache.properties_count(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.set_properties(record("dek2"));
        assert!(cache.get_properties("dek1").is_none());
        assert_eq!(cache.properties_count(), 2);

        assert_eq!(cache.sweep(Duration::ZERO), 1);
        assert_eq!(cache.properties_count(), 1);
        assert!(cache.get_properties("dek2").is_some());
    }
}

//! DEK provider.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use coffer_crypto::{AlgorithmFamily, CellCipher, EncryptionAlgorithm};
use coffer_keywrap::{KeyStoreProvider, KeyStoreWrapProvider, KeyWrapProvider};
use coffer_storage::{DocumentStore, PartitionKey};
use tracing::info;
use zeroize::Zeroizing;

use crate::cache::{DekCache, DekCacheConfig};
use crate::container::DataEncryptionKeyContainer;
use crate::error::DekError;
use crate::properties::DataEncryptionKeyProperties;

/// Resolves DEK ids to ready-to-use cell ciphers.
#[async_trait]
pub trait DataEncryptionKeyResolver: Send + Sync {
    /// Returns a cipher for `id` used with `algorithm`, or `None` if the
    /// resolver has no usable key.
    async fn fetch_data_encryption_key(
        &self,
        id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Option<Arc<CellCipher>>, DekError>;
}

/// Builder for [`DataEncryptionKeyProvider`].
#[derive(Default)]
pub struct DataEncryptionKeyProviderBuilder {
    legacy: Option<Arc<dyn KeyWrapProvider>>,
    key_store: Option<Arc<dyn KeyWrapProvider>>,
    cache_config: DekCacheConfig,
}

impl DataEncryptionKeyProviderBuilder {
    /// Wrap provider for legacy-family DEKs.
    pub fn with_legacy_wrap_provider(mut self, provider: Arc<dyn KeyWrapProvider>) -> Self {
        self.legacy = Some(provider);
        self
    }

    /// Key store provider for key-store-family DEKs.
    pub fn with_key_store_provider(mut self, provider: Arc<dyn KeyStoreProvider>) -> Self {
        self.key_store = Some(Arc::new(KeyStoreWrapProvider::new(provider)));
        self
    }

    /// Wrap provider for key-store-family DEKs, already adapted.
    pub fn with_key_store_wrap_provider(mut self, provider: Arc<dyn KeyWrapProvider>) -> Self {
        self.key_store = Some(provider);
        self
    }

    /// Cache configuration.
    pub fn with_cache_config(mut self, config: DekCacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Builds the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if no wrap provider was configured.
    pub fn build(self) -> Result<DataEncryptionKeyProvider, DekError> {
        if self.legacy.is_none() && self.key_store.is_none() {
            return Err(DekError::InvalidArgument(
                "at least one key wrap provider is required".to_string(),
            ));
        }

        Ok(DataEncryptionKeyProvider {
            legacy: self.legacy,
            key_store: self.key_store,
            cache: Arc::new(DekCache::new(self.cache_config.properties_ttl)),
            cache_config: self.cache_config,
            container: OnceLock::new(),
        })
    }
}

/// Owns the DEK container, the wrap providers and the DEK cache.
pub struct DataEncryptionKeyProvider {
    legacy: Option<Arc<dyn KeyWrapProvider>>,
    key_store: Option<Arc<dyn KeyWrapProvider>>,
    cache: Arc<DekCache>,
    cache_config: DekCacheConfig,
    container: OnceLock<Arc<dyn DocumentStore>>,
}

impl DataEncryptionKeyProvider {
    /// Starts building a provider.
    pub fn builder() -> DataEncryptionKeyProviderBuilder {
        DataEncryptionKeyProviderBuilder::default()
    }

    /// Attaches the DEK container and starts the cache sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not partitioned by `/id` or the
    /// provider is already initialized.
    pub async fn initialize(&self, container: Arc<dyn DocumentStore>) -> Result<(), DekError> {
        if container.properties().partition_key_paths != ["/id"] {
            return Err(DekError::InvalidContainer(format!(
                "container '{}' must be partitioned by /id",
                container.id()
            )));
        }

        let id = container.id().to_string();
        self.container
            .set(container)
            .map_err(|_| DekError::AlreadyInitialized)?;

        if let Some(interval) = self.cache_config.cleanup_interval {
            self.cache
                .start_cleanup(interval, self.cache_config.cleanup_buffer);
        }

        info!(container = %id, "Data encryption key provider initialized");
        Ok(())
    }

    /// Operations on DEK records.
    pub fn data_encryption_key_container(&self) -> DataEncryptionKeyContainer<'_> {
        DataEncryptionKeyContainer::new(self)
    }

    /// The DEK cache.
    pub fn cache(&self) -> &Arc<DekCache> {
        &self.cache
    }

    pub(crate) fn store(&self) -> Result<&Arc<dyn DocumentStore>, DekError> {
        self.container.get().ok_or(DekError::NotInitialized)
    }

    pub(crate) fn wrap_provider_for(
        &self,
        algorithm: EncryptionAlgorithm,
    ) -> Result<&Arc<dyn KeyWrapProvider>, DekError> {
        let family = algorithm.family();
        match family {
            AlgorithmFamily::Legacy => self.legacy.as_ref(),
            AlgorithmFamily::KeyStore => self.key_store.as_ref(),
        }
        .ok_or(DekError::ProviderNotConfigured(family))
    }

    /// Reads a DEK record, from cache when fresh.
    pub(crate) async fn read_properties(
        &self,
        id: &str,
    ) -> Result<DataEncryptionKeyProperties, DekError> {
        if let Some(properties) = self.cache.get_properties(id) {
            return Ok(properties);
        }

        let response = self.store()?.read_item(id, &PartitionKey::new(id)).await?;
        let document = response
            .resource
            .ok_or_else(|| DekError::Serialization(format!("empty record for {id}")))?;
        let properties = DataEncryptionKeyProperties::from_document(document)?;

        self.cache.set_properties(properties.clone());
        Ok(properties)
    }

    /// Unwraps the raw key of `id`, through the cache.
    pub(crate) async fn fetch_raw_key(&self, id: &str) -> Result<Zeroizing<Vec<u8>>, DekError> {
        self.cache
            .get_or_add_raw_key(id, move || async move {
                let properties = self.read_properties(id).await?;
                let provider = self.wrap_provider_for(properties.encryption_algorithm)?;

                let result = provider
                    .unwrap_key(
                        &properties.wrapped_data_encryption_key,
                        &properties.encryption_key_wrap_metadata,
                    )
                    .await?;

                let ttl = self
                    .cache_config
                    .raw_dek_ttl_override
                    .unwrap_or(result.client_cache_ttl);
                Ok::<_, DekError>((result.key, ttl))
            })
            .await
    }
}

#[async_trait]
impl DataEncryptionKeyResolver for DataEncryptionKeyProvider {
    /// A DEK may be used with an algorithm of either family; the wrap
    /// provider is picked by the algorithm the DEK was created with.
    async fn fetch_data_encryption_key(
        &self,
        id: &str,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Option<Arc<CellCipher>>, DekError> {
        let raw = self.fetch_raw_key(id).await?;
        Ok(Some(Arc::new(CellCipher::new(&raw, algorithm)?)))
    }
}

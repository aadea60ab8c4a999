//! DEK record operations.

use std::sync::Arc;

use coffer_crypto::{AlgorithmFamily, DataEncryptionKey, EncryptionAlgorithm};
use coffer_keywrap::EncryptionKeyWrapMetadata;
use coffer_storage::{
    DocumentStore, ItemRequestOptions, ItemResponse, PartitionKey, QueryDefinition, StorageError,
};
use tracing::{debug, info, warn};

use crate::error::DekError;
use crate::properties::DataEncryptionKeyProperties;
use crate::provider::DataEncryptionKeyProvider;

/// Attempts before a rewrap racing with concurrent updates gives up.
const MAX_REWRAP_ATTEMPTS: usize = 5;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn into_properties(
    response: ItemResponse<serde_json::Value>,
) -> Result<ItemResponse<DataEncryptionKeyProperties>, DekError> {
    response.try_map(DataEncryptionKeyProperties::from_document)
}

/// Create, read, rewrap and enumerate DEK records.
pub struct DataEncryptionKeyContainer<'a> {
    provider: &'a DataEncryptionKeyProvider,
}

impl<'a> DataEncryptionKeyContainer<'a> {
    pub(crate) fn new(provider: &'a DataEncryptionKeyProvider) -> Self {
        Self { provider }
    }

    /// Generates a DEK, wraps it under `metadata` and stores the record.
    ///
    /// # Errors
    ///
    /// Fails with a storage `Conflict` if the id is taken, and with
    /// [`DekError::ProviderNotConfigured`] before any wrap call if the
    /// algorithm family has no wrap provider.
    pub async fn create_data_encryption_key(
        &self,
        id: &str,
        algorithm: EncryptionAlgorithm,
        metadata: EncryptionKeyWrapMetadata,
    ) -> Result<ItemResponse<DataEncryptionKeyProperties>, DekError> {
        if id.is_empty() {
            return Err(DekError::InvalidArgument("id cannot be empty".to_string()));
        }
        let store = self.provider.store()?;
        let wrap_provider = self.provider.wrap_provider_for(algorithm)?;

        let raw = DataEncryptionKey::generate();
        let wrapped = wrap_provider.wrap_key(raw.as_bytes(), &metadata).await?;

        let properties = DataEncryptionKeyProperties::new(
            id,
            algorithm,
            wrapped.wrapped_key,
            wrapped.metadata,
            now(),
        );

        let response = store
            .create_item(properties.to_document()?, &PartitionKey::new(id))
            .await?;
        let response = into_properties(response)?;

        if let Some(created) = &response.resource {
            self.provider.cache().set_properties(created.clone());
        }

        info!(id = id, algorithm = %algorithm, "Data encryption key created");
        Ok(response)
    }

    /// Reads a DEK record from the store.
    pub async fn read_data_encryption_key(
        &self,
        id: &str,
    ) -> Result<ItemResponse<DataEncryptionKeyProperties>, DekError> {
        let store = self.provider.store()?;
        let response = into_properties(store.read_item(id, &PartitionKey::new(id)).await?)?;

        if let Some(properties) = &response.resource {
            self.provider.cache().set_properties(properties.clone());
        }
        Ok(response)
    }

    /// Re-wraps a DEK under new metadata and optionally a new algorithm.
    ///
    /// The record is re-read from the store on every attempt, so a stale
    /// cached copy never causes a failure. A concurrent update between the
    /// read and the write is retried; the last writer wins.
    ///
    /// # Errors
    ///
    /// Moving a key-store DEK to a legacy algorithm fails with
    /// [`DekError::UnsupportedAlgorithm`]. A record deleted concurrently
    /// surfaces as a storage `NotFound`.
    pub async fn rewrap_data_encryption_key(
        &self,
        id: &str,
        new_metadata: EncryptionKeyWrapMetadata,
        new_algorithm: Option<EncryptionAlgorithm>,
    ) -> Result<ItemResponse<DataEncryptionKeyProperties>, DekError> {
        let store = self.provider.store()?;
        let pk = PartitionKey::new(id);

        for attempt in 1..=MAX_REWRAP_ATTEMPTS {
            let current = into_properties(store.read_item(id, &pk).await?)?;
            let etag = current.etag;
            let current = current
                .resource
                .ok_or_else(|| DekError::Serialization(format!("empty record for {id}")))?;

            let algorithm = new_algorithm.unwrap_or(current.encryption_algorithm);
            if current.encryption_algorithm.family() == AlgorithmFamily::KeyStore
                && algorithm.family() == AlgorithmFamily::Legacy
            {
                return Err(DekError::UnsupportedAlgorithm(format!(
                    "cannot rewrap {} from {} to {}",
                    id, current.encryption_algorithm, algorithm
                )));
            }

            let unwrapped = self
                .provider
                .wrap_provider_for(current.encryption_algorithm)?
                .unwrap_key(
                    &current.wrapped_data_encryption_key,
                    &current.encryption_key_wrap_metadata,
                )
                .await?;
            let wrapped = self
                .provider
                .wrap_provider_for(algorithm)?
                .wrap_key(&unwrapped.key, &new_metadata)
                .await?;

            let updated = DataEncryptionKeyProperties {
                encryption_algorithm: algorithm,
                wrapped_data_encryption_key: wrapped.wrapped_key,
                encryption_key_wrap_metadata: wrapped.metadata,
                ..current
            };

            let options = ItemRequestOptions {
                if_match_etag: etag,
            };
            match store
                .replace_item(id, updated.to_document()?, &pk, &options)
                .await
            {
                Ok(response) => {
                    let response = into_properties(response)?;
                    if let Some(properties) = &response.resource {
                        self.provider.cache().set_properties(properties.clone());
                    }
                    info!(id = id, algorithm = %algorithm, "Data encryption key rewrapped");
                    return Ok(response);
                }
                Err(StorageError::PreconditionFailed(_)) => {
                    warn!(id = id, attempt = attempt, "Rewrap raced with a concurrent update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DekError::ConcurrentModification(id.to_string()))
    }

    /// Pages through DEK records matching `query`.
    pub fn get_data_encryption_key_query_iterator(
        &self,
        query: QueryDefinition,
        max_item_count: usize,
    ) -> Result<DataEncryptionKeyFeedIterator, DekError> {
        Ok(DataEncryptionKeyFeedIterator {
            store: self.provider.store()?.clone(),
            query,
            max_item_count,
            continuation: None,
            has_more_results: true,
        })
    }
}

/// One page of DEK records.
#[derive(Debug, Clone)]
pub struct DataEncryptionKeyFeedResponse {
    /// Records in this page.
    pub items: Vec<DataEncryptionKeyProperties>,
    /// Token of the next page, if any.
    pub continuation_token: Option<String>,
    /// Cost reported by the store.
    pub request_charge: f64,
}

/// Iterator over pages of DEK records.
pub struct DataEncryptionKeyFeedIterator {
    store: Arc<dyn DocumentStore>,
    query: QueryDefinition,
    max_item_count: usize,
    continuation: Option<String>,
    has_more_results: bool,
}

impl DataEncryptionKeyFeedIterator {
    /// Whether another page can be read.
    pub fn has_more_results(&self) -> bool {
        self.has_more_results
    }

    /// Reads the next page. Once exhausted, returns empty pages.
    pub async fn read_next(&mut self) -> Result<DataEncryptionKeyFeedResponse, DekError> {
        if !self.has_more_results {
            return Ok(DataEncryptionKeyFeedResponse {
                items: Vec::new(),
                continuation_token: None,
                request_charge: 0.0,
            });
        }

        let page = self
            .store
            .query_items(&self.query, self.continuation.as_deref(), self.max_item_count)
            .await?;

        let items = page
            .items
            .into_iter()
            .map(DataEncryptionKeyProperties::from_document)
            .collect::<Result<Vec<_>, _>>()?;

        self.continuation = page.continuation_token.clone();
        self.has_more_results = page.continuation_token.is_some();

        debug!(count = items.len(), has_more = self.has_more_results, "Data encryption key page");

        Ok(DataEncryptionKeyFeedResponse {
            items,
            continuation_token: page.continuation_token,
            request_charge: page.request_charge,
        })
    }
}

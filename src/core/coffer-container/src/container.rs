//! The encryption container.

use std::sync::Arc;

use coffer_encryption::{
    decrypt_document, encrypt_document, encrypt_document_with_policy, encrypt_query_parameter,
    ClientEncryptionPolicy, EncryptionOptions, Encryptor,
};
use coffer_storage::{
    ChangeFeedStart, DocumentStore, ItemRequestOptions, ItemResponse, PartitionKey,
    QueryDefinition, StorageError,
};
use futures::future::try_join_all;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::batch::EncryptionTransactionalBatch;
use crate::decryptable::DecryptableItem;
use crate::error::ContainerError;
use crate::feed::EncryptionFeedIterator;
use crate::handler::DecryptionResultHandler;
use crate::reencryption::{ReencryptionIterator, ReencryptionOptions};
use crate::response::ResponseMessage;

/// Options of an item operation on an [`EncryptionContainer`].
#[derive(Debug, Clone, Default)]
pub struct EncryptionItemRequestOptions {
    /// Paths to encrypt on write. Not allowed on containers with a client
    /// encryption policy.
    pub encryption_options: Option<EncryptionOptions>,
    /// Only apply the write if the stored etag matches.
    pub if_match_etag: Option<String>,
}

impl EncryptionItemRequestOptions {
    /// Options encrypting with `options`.
    pub fn encrypt(options: EncryptionOptions) -> Self {
        Self {
            encryption_options: Some(options),
            if_match_etag: None,
        }
    }

    /// Adds an `if-match` precondition.
    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match_etag = Some(etag.into());
        self
    }
}

fn require_pk<'a>(
    partition_key: Option<&'a PartitionKey>,
    operation: &'static str,
) -> Result<&'a PartitionKey, ContainerError> {
    partition_key.ok_or(ContainerError::PartitionKeyRequired(operation))
}

fn encryption_options(options: Option<&EncryptionItemRequestOptions>) -> Option<&EncryptionOptions> {
    options.and_then(|o| o.encryption_options.as_ref())
}

pub(crate) fn request_options(options: Option<&EncryptionItemRequestOptions>) -> ItemRequestOptions {
    ItemRequestOptions {
        if_match_etag: options.and_then(|o| o.if_match_etag.clone()),
    }
}

fn typed<T: DeserializeOwned>(
    response: ItemResponse<Value>,
) -> Result<ItemResponse<T>, ContainerError> {
    response.try_map(|value| Ok(serde_json::from_value(value)?))
}

/// Encrypting and decrypting view of a document container.
#[derive(Clone)]
pub struct EncryptionContainer {
    store: Arc<dyn DocumentStore>,
    encryptor: Arc<dyn Encryptor>,
    policy: Option<Arc<ClientEncryptionPolicy>>,
    handler: Option<Arc<dyn DecryptionResultHandler>>,
}

impl EncryptionContainer {
    /// Wraps `store`. The client encryption policy, if the container has
    /// one, is read and validated here.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        encryptor: Arc<dyn Encryptor>,
    ) -> Result<Self, ContainerError> {
        let properties = store.properties();
        let policy = ClientEncryptionPolicy::from_container_properties(properties)?;
        if let Some(policy) = &policy {
            policy.validate(&properties.partition_key_paths)?;
        }

        Ok(Self {
            store,
            encryptor,
            policy: policy.map(Arc::new),
            handler: None,
        })
    }

    /// Routes decryption failures to `handler` instead of failing the
    /// operation.
    pub fn with_decryption_result_handler(
        mut self,
        handler: impl DecryptionResultHandler + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Container id.
    pub fn id(&self) -> &str {
        self.store.id()
    }

    /// The wrapped store. Documents read through it stay encrypted.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The encryptor.
    pub fn encryptor(&self) -> &Arc<dyn Encryptor> {
        &self.encryptor
    }

    /// The container's client encryption policy.
    pub fn client_encryption_policy(&self) -> Option<&ClientEncryptionPolicy> {
        self.policy.as_deref()
    }

    pub(crate) fn partition_key_paths(&self) -> &[String] {
        &self.store.properties().partition_key_paths
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    pub(crate) async fn encrypt_item(
        &self,
        item: Value,
        options: Option<&EncryptionOptions>,
    ) -> Result<Value, ContainerError> {
        let encryptor = &*self.encryptor;
        match (options, self.policy.as_deref()) {
            (Some(_), Some(_)) => Err(ContainerError::Unsupported(format!(
                "container '{}' has a client encryption policy; per-operation encryption options are not allowed",
                self.id()
            ))),
            (Some(options), None) => {
                Ok(encrypt_document(item, options, self.partition_key_paths(), encryptor).await?)
            }
            (None, Some(policy)) => Ok(encrypt_document_with_policy(item, policy, encryptor).await?),
            (None, None) => Ok(item),
        }
    }

    /// Decrypts one document, handing failures to the handler if there is
    /// one.
    pub(crate) async fn decrypt_item(&self, item: Value) -> Result<Value, ContainerError> {
        let Some(handler) = &self.handler else {
            let (plain, _) = decrypt_document(item, &*self.encryptor).await?;
            return Ok(plain);
        };

        let encrypted = item.clone();
        match decrypt_document(item, &*self.encryptor).await {
            Ok((plain, _)) => Ok(plain),
            Err(err) => {
                warn!(container = %self.id(), error = %err, "Decryption failed, routed to handler");
                handler.handle(&encrypted, &err);
                Ok(encrypted)
            }
        }
    }

    pub(crate) async fn decrypt_items(&self, items: Vec<Value>) -> Result<Vec<Value>, ContainerError> {
        try_join_all(items.into_iter().map(|item| self.decrypt_item(item))).await
    }

    async fn decrypt_response(
        &self,
        response: ItemResponse<Value>,
    ) -> Result<ItemResponse<Value>, ContainerError> {
        let ItemResponse {
            status,
            resource,
            etag,
            request_charge,
        } = response;

        let resource = match resource {
            Some(item) => Some(self.decrypt_item(item).await?),
            None => None,
        };

        Ok(ItemResponse {
            status,
            resource,
            etag,
            request_charge,
        })
    }

    async fn stream(
        &self,
        result: Result<ItemResponse<Value>, StorageError>,
    ) -> Result<ResponseMessage, ContainerError> {
        match result {
            Ok(response) => Ok(self.decrypt_response(response).await?.into()),
            Err(err) => Ok(ResponseMessage::from_error(&err)),
        }
    }

    // ========================================================================
    // Typed item operations
    // ========================================================================

    /// Encrypts and creates an item.
    pub async fn create_item<T>(
        &self,
        item: &T,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ItemResponse<T>, ContainerError>
    where
        T: Serialize + DeserializeOwned,
    {
        let pk = require_pk(partition_key, "create_item")?;
        let item = self
            .encrypt_item(serde_json::to_value(item)?, encryption_options(options))
            .await?;
        let response = self.store.create_item(item, pk).await?;
        typed(self.decrypt_response(response).await?)
    }

    /// Reads and decrypts an item.
    pub async fn read_item<T: DeserializeOwned>(
        &self,
        id: &str,
        partition_key: Option<&PartitionKey>,
    ) -> Result<ItemResponse<T>, ContainerError> {
        let pk = require_pk(partition_key, "read_item")?;
        let response = self.store.read_item(id, pk).await?;
        typed(self.decrypt_response(response).await?)
    }

    /// Encrypts and replaces an item.
    pub async fn replace_item<T>(
        &self,
        item: &T,
        id: &str,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ItemResponse<T>, ContainerError>
    where
        T: Serialize + DeserializeOwned,
    {
        let pk = require_pk(partition_key, "replace_item")?;
        let item = self
            .encrypt_item(serde_json::to_value(item)?, encryption_options(options))
            .await?;
        let response = self
            .store
            .replace_item(id, item, pk, &request_options(options))
            .await?;
        typed(self.decrypt_response(response).await?)
    }

    /// Encrypts and creates or replaces an item.
    pub async fn upsert_item<T>(
        &self,
        item: &T,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ItemResponse<T>, ContainerError>
    where
        T: Serialize + DeserializeOwned,
    {
        let pk = require_pk(partition_key, "upsert_item")?;
        let item = self
            .encrypt_item(serde_json::to_value(item)?, encryption_options(options))
            .await?;
        let response = self
            .store
            .upsert_item(item, pk, &request_options(options))
            .await?;
        typed(self.decrypt_response(response).await?)
    }

    /// Deletes an item.
    pub async fn delete_item(
        &self,
        id: &str,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ItemResponse<Value>, ContainerError> {
        let pk = require_pk(partition_key, "delete_item")?;
        Ok(self
            .store
            .delete_item(id, pk, &request_options(options))
            .await?)
    }

    /// Reads an item without decrypting it. Decryption happens when
    /// [`DecryptableItem::get_item`] is called.
    pub async fn read_item_decryptable(
        &self,
        id: &str,
        partition_key: Option<&PartitionKey>,
    ) -> Result<ItemResponse<DecryptableItem>, ContainerError> {
        let pk = require_pk(partition_key, "read_item_decryptable")?;
        let response = self.store.read_item(id, pk).await?;
        let encryptor = self.encryptor.clone();
        response.try_map(|item| Ok::<_, ContainerError>(DecryptableItem::new(item, encryptor)))
    }

    // ========================================================================
    // Stream item operations
    // ========================================================================

    /// Encrypts and creates a raw document.
    pub async fn create_item_stream(
        &self,
        item: Value,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ResponseMessage, ContainerError> {
        let pk = require_pk(partition_key, "create_item_stream")?;
        let item = self.encrypt_item(item, encryption_options(options)).await?;
        self.stream(self.store.create_item(item, pk).await).await
    }

    /// Reads and decrypts a raw document.
    pub async fn read_item_stream(
        &self,
        id: &str,
        partition_key: Option<&PartitionKey>,
    ) -> Result<ResponseMessage, ContainerError> {
        let pk = require_pk(partition_key, "read_item_stream")?;
        self.stream(self.store.read_item(id, pk).await).await
    }

    /// Encrypts and replaces a raw document.
    pub async fn replace_item_stream(
        &self,
        item: Value,
        id: &str,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ResponseMessage, ContainerError> {
        let pk = require_pk(partition_key, "replace_item_stream")?;
        let item = self.encrypt_item(item, encryption_options(options)).await?;
        self.stream(
            self.store
                .replace_item(id, item, pk, &request_options(options))
                .await,
        )
        .await
    }

    /// Encrypts and creates or replaces a raw document.
    pub async fn upsert_item_stream(
        &self,
        item: Value,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ResponseMessage, ContainerError> {
        let pk = require_pk(partition_key, "upsert_item_stream")?;
        let item = self.encrypt_item(item, encryption_options(options)).await?;
        self.stream(
            self.store
                .upsert_item(item, pk, &request_options(options))
                .await,
        )
        .await
    }

    /// Deletes a document.
    pub async fn delete_item_stream(
        &self,
        id: &str,
        partition_key: Option<&PartitionKey>,
        options: Option<&EncryptionItemRequestOptions>,
    ) -> Result<ResponseMessage, ContainerError> {
        let pk = require_pk(partition_key, "delete_item_stream")?;
        self.stream(
            self.store
                .delete_item(id, pk, &request_options(options))
                .await,
        )
        .await
    }

    // ========================================================================
    // Feeds, batches, re-encryption
    // ========================================================================

    /// Pages through query results, decrypted.
    pub fn get_item_query_iterator(
        &self,
        query: QueryDefinition,
        max_item_count: usize,
    ) -> EncryptionFeedIterator {
        EncryptionFeedIterator::query(self.clone(), query, max_item_count)
    }

    /// Pages through the change feed, decrypted.
    pub fn get_change_feed_iterator(
        &self,
        start: ChangeFeedStart,
        max_item_count: usize,
    ) -> EncryptionFeedIterator {
        EncryptionFeedIterator::change_feed(self.clone(), start, max_item_count)
    }

    /// Encrypts a value compared for equality against a deterministically
    /// encrypted policy path, for use in a [`QueryDefinition`].
    pub async fn encrypt_query_parameter(
        &self,
        path: &str,
        value: &Value,
    ) -> Result<Value, ContainerError> {
        let policy = self.policy.as_deref().ok_or_else(|| {
            ContainerError::Unsupported(format!(
                "container '{}' has no client encryption policy",
                self.id()
            ))
        })?;
        Ok(encrypt_query_parameter(policy, path, value, &*self.encryptor).await?)
    }

    /// Starts a transactional batch on one partition.
    pub fn create_transactional_batch(&self, partition_key: PartitionKey) -> EncryptionTransactionalBatch {
        EncryptionTransactionalBatch::new(self.clone(), partition_key)
    }

    /// Copies documents from this container into `destination`,
    /// re-encrypting them under the destination's settings.
    ///
    /// Fails with `Unsupported` if the destination would receive plaintext
    /// without [`ReencryptionOptions::with_plaintext_destination`], or if it
    /// has both a policy and destination encryption options.
    pub fn get_reencryption_iterator(
        &self,
        destination: EncryptionContainer,
        options: ReencryptionOptions,
    ) -> Result<ReencryptionIterator, ContainerError> {
        ReencryptionIterator::new(self.clone(), destination, options)
    }
}

/// Wraps a document store in an [`EncryptionContainer`].
pub trait WithEncryptor {
    /// Attaches `encryptor`.
    fn with_encryptor(self, encryptor: Arc<dyn Encryptor>) -> Result<EncryptionContainer, ContainerError>;
}

impl<S: DocumentStore + 'static> WithEncryptor for Arc<S> {
    fn with_encryptor(self, encryptor: Arc<dyn Encryptor>) -> Result<EncryptionContainer, ContainerError> {
        EncryptionContainer::new(self, encryptor)
    }
}

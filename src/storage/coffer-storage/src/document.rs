//! Document container trait definition.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::{
    BatchOperation, BatchResponse, ChangeFeedMode, ChangeFeedStart, ContainerProperties,
    FeedResponse, ItemRequestOptions, ItemResponse, PartitionKey, QueryDefinition,
};

/// A container of JSON documents.
///
/// Every document is an object with a string `id`, unique within its
/// partition. Returned documents carry the store-managed `_etag`, `_ts`,
/// `_self` and `_lsn` properties.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Container properties.
    fn properties(&self) -> &ContainerProperties;

    /// Container id.
    fn id(&self) -> &str {
        &self.properties().id
    }

    /// Creates a document. Fails with `Conflict` if the id is taken.
    async fn create_item(
        &self,
        item: Value,
        partition_key: &PartitionKey,
    ) -> Result<ItemResponse<Value>, StorageError>;

    /// Reads a document.
    async fn read_item(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> Result<ItemResponse<Value>, StorageError>;

    /// Replaces an existing document.
    async fn replace_item(
        &self,
        id: &str,
        item: Value,
        partition_key: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError>;

    /// Creates or replaces a document.
    async fn upsert_item(
        &self,
        item: Value,
        partition_key: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError>;

    /// Deletes a document.
    async fn delete_item(
        &self,
        id: &str,
        partition_key: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError>;

    /// Returns one page of query results.
    async fn query_items(
        &self,
        query: &QueryDefinition,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<FeedResponse, StorageError>;

    /// Returns one page of the incremental change feed.
    ///
    /// With [`ChangeFeedMode::WithDeletes`] the page also carries a
    /// [`crate::ChangeFeedDelete`] tombstone for each delete, in log order.
    /// A caught-up feed answers `NotModified` with the token it was given.
    async fn read_change_feed(
        &self,
        start: &ChangeFeedStart,
        mode: ChangeFeedMode,
        max_item_count: usize,
    ) -> Result<FeedResponse, StorageError>;

    /// Executes operations within one partition atomically.
    async fn execute_batch(
        &self,
        partition_key: &PartitionKey,
        operations: Vec<BatchOperation>,
    ) -> Result<BatchResponse, StorageError>;
}

//! # Coffer Storage
//!
//! Storage abstraction layer for Coffer backends.
//!
//! Two seams are defined here:
//! - [`StorageBackend`]: a flat key-value store, used by the local key vault
//! - [`DocumentStore`]: one container of JSON documents with partitioned
//!   point operations, paged queries, an incremental change feed and
//!   transactional batches

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod document;
pub mod error;
pub mod types;

pub use backend::StorageBackend;
pub use document::DocumentStore;
pub use error::StorageError;
pub use types::{
    strip_system_properties, BatchOperation, BatchOperationResult, BatchResponse,
    ChangeFeedDelete, ChangeFeedMode, ChangeFeedStart, ContainerProperties, FeedResponse, Filter,
    ItemRequestOptions, ItemResponse, PartitionKey, QueryDefinition, SortOrder, StatusCode,
    CHANGE_FEED_METADATA, DELETE_OPERATION, SYSTEM_PROPERTIES,
};

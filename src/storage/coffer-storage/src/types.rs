//! Request and response types shared by document store implementations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Properties stamped on every stored document by the store.
pub const SYSTEM_PROPERTIES: &[&str] = &["_etag", "_ts", "_self", "_lsn", "_metadata"];

/// Removes store-managed properties from a document.
pub fn strip_system_properties(document: &mut Value) {
    if let Value::Object(map) = document {
        for name in SYSTEM_PROPERTIES {
            map.remove(*name);
        }
    }
}

/// Status of a store response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 200
    Ok,
    /// 201
    Created,
    /// 204
    NoContent,
    /// 207, some items of a multi-item operation failed.
    MultiStatus,
    /// 304, nothing new in a change feed.
    NotModified,
    /// 400
    BadRequest,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 412
    PreconditionFailed,
    /// 424, batch operation not applied because a sibling failed.
    FailedDependency,
    /// 500
    InternalServerError,
    /// 503
    ServiceUnavailable,
}

impl StatusCode {
    /// Numeric HTTP-style code.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::NoContent => 204,
            Self::MultiStatus => 207,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::FailedDependency => 424,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Returns true for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Partition key value of a document, possibly hierarchical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(Vec<Value>);

impl PartitionKey {
    /// Single-level partition key.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Hierarchical partition key, one value per partition key path.
    pub fn hierarchical(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Component values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Canonical string form used as a storage key.
    pub fn to_key_string(&self) -> String {
        Value::Array(self.0.clone()).to_string()
    }

    /// Extracts the partition key of `document` for the given paths.
    ///
    /// Returns `None` if any path is missing from the document.
    pub fn from_document(document: &Value, paths: &[String]) -> Option<Self> {
        paths
            .iter()
            .map(|path| value_at(document, path).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

fn value_at<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |node, segment| node.as_object()?.get(segment))
}

/// Properties of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    /// Container id.
    pub id: String,
    /// Partition key paths, e.g. `["/tenant"]`.
    pub partition_key_paths: Vec<String>,
    /// Client encryption policy, opaque to the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_encryption_policy: Option<Value>,
}

impl ContainerProperties {
    /// Container partitioned by a single path.
    pub fn new(id: impl Into<String>, partition_key_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key_paths: vec![partition_key_path.into()],
            client_encryption_policy: None,
        }
    }

    /// Attaches a client encryption policy.
    pub fn with_client_encryption_policy(mut self, policy: Value) -> Self {
        self.client_encryption_policy = Some(policy);
        self
    }
}

/// Options of a point operation.
#[derive(Debug, Clone, Default)]
pub struct ItemRequestOptions {
    /// Only apply the write if the stored etag matches.
    pub if_match_etag: Option<String>,
}

impl ItemRequestOptions {
    /// Options with an `if-match` precondition.
    pub fn if_match(etag: impl Into<String>) -> Self {
        Self {
            if_match_etag: Some(etag.into()),
        }
    }
}

/// Response of a point operation.
#[derive(Debug, Clone)]
pub struct ItemResponse<T> {
    /// Status code.
    pub status: StatusCode,
    /// Returned document, absent for deletes.
    pub resource: Option<T>,
    /// Etag of the stored document.
    pub etag: Option<String>,
    /// Cost of the operation.
    pub request_charge: f64,
}

impl<T> ItemResponse<T> {
    /// Converts the resource, keeping the response metadata.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<ItemResponse<U>, E> {
        Ok(ItemResponse {
            status: self.status,
            resource: self.resource.map(f).transpose()?,
            etag: self.etag,
            request_charge: self.request_charge,
        })
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Query predicate over a document path.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Value at `path` equals `value`.
    Equals {
        /// Document path, e.g. `/address/city`.
        path: String,
        /// Expected value.
        value: Value,
    },
    /// Value at `path` is within the inclusive bounds.
    Range {
        /// Document path.
        path: String,
        /// Lower bound, inclusive.
        lower: Option<Value>,
        /// Upper bound, inclusive.
        upper: Option<Value>,
    },
}

/// Structured query: a conjunction of filters with optional ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryDefinition {
    /// Filters, all of which must match.
    pub filters: Vec<Filter>,
    /// Ordering path and direction. Unordered queries page in store order.
    pub order_by: Option<(String, SortOrder)>,
    /// Restricts the query to one partition.
    pub partition_key: Option<PartitionKey>,
}

impl QueryDefinition {
    /// Query matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality filter.
    pub fn where_eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equals {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    /// Adds an inclusive range filter.
    pub fn where_range(
        mut self,
        path: impl Into<String>,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Self {
        self.filters.push(Filter::Range {
            path: path.into(),
            lower,
            upper,
        });
        self
    }

    /// Orders results by the value at `path`.
    pub fn order_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((path.into(), order));
        self
    }

    /// Restricts the query to one partition.
    pub fn with_partition_key(mut self, partition_key: PartitionKey) -> Self {
        self.partition_key = Some(partition_key);
        self
    }
}

/// One page of a query or change feed.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    /// `Ok`, or `NotModified` for a caught-up change feed.
    pub status: StatusCode,
    /// Documents of the page.
    pub items: Vec<Value>,
    /// Token to resume after this page. Absent when a query is exhausted.
    pub continuation_token: Option<String>,
    /// Cost of the page.
    pub request_charge: f64,
}

/// Where a change feed starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFeedStart {
    /// Every document currently in the container.
    Beginning,
    /// Changes after a previously returned token.
    Continuation(String),
}

/// Which changes a change feed reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeFeedMode {
    /// The latest version of every document changed since the start.
    #[default]
    LatestVersion,
    /// Latest versions plus a tombstone for every delete since the start.
    WithDeletes,
}

/// Property carrying the change metadata of a change feed tombstone.
pub const CHANGE_FEED_METADATA: &str = "_metadata";

/// Operation type recorded in the metadata of a delete tombstone.
pub const DELETE_OPERATION: &str = "delete";

/// A delete reported by a [`ChangeFeedMode::WithDeletes`] change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedDelete {
    /// Id of the deleted document.
    pub id: String,
    /// Partition key of the deleted document.
    pub partition_key: PartitionKey,
}

impl ChangeFeedDelete {
    /// Tombstone document as it appears in a change feed page.
    pub fn to_document(&self) -> Value {
        json!({
            "id": self.id,
            "_metadata": {
                "operationType": DELETE_OPERATION,
                "partitionKey": self.partition_key,
            },
        })
    }

    /// Parses a change feed item. Returns `None` unless it is a delete
    /// tombstone.
    pub fn from_document(document: &Value) -> Option<Self> {
        let metadata = document.get(CHANGE_FEED_METADATA)?;
        if metadata.get("operationType")?.as_str()? != DELETE_OPERATION {
            return None;
        }

        Some(Self {
            id: document.get("id")?.as_str()?.to_string(),
            partition_key: serde_json::from_value(metadata.get("partitionKey")?.clone()).ok()?,
        })
    }
}

/// One operation of a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Create a document.
    Create {
        /// Document to create.
        resource: Value,
    },
    /// Read a document.
    Read {
        /// Document id.
        id: String,
    },
    /// Replace a document.
    Replace {
        /// Document id.
        id: String,
        /// New document.
        resource: Value,
        /// Preconditions.
        options: ItemRequestOptions,
    },
    /// Create or replace a document.
    Upsert {
        /// Document to write.
        resource: Value,
        /// Preconditions.
        options: ItemRequestOptions,
    },
    /// Delete a document.
    Delete {
        /// Document id.
        id: String,
        /// Preconditions.
        options: ItemRequestOptions,
    },
}

/// Result of one batch operation.
#[derive(Debug, Clone)]
pub struct BatchOperationResult {
    /// Status of this operation.
    pub status: StatusCode,
    /// Returned document.
    pub resource: Option<Value>,
    /// Etag after the operation.
    pub etag: Option<String>,
}

/// Result of a transactional batch.
#[derive(Debug, Clone)]
pub struct BatchResponse {
    /// Overall status: the status of the failing operation, or `Ok`.
    pub status: StatusCode,
    /// Per-operation results, in request order.
    pub results: Vec<BatchOperationResult>,
    /// Message of the failing operation.
    pub error_message: Option<String>,
    /// Cost of the batch.
    pub request_charge: f64,
}

impl BatchResponse {
    /// Returns true if every operation was applied.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

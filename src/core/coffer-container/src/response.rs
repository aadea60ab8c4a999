//! Stream responses.

use coffer_storage::{ItemResponse, StatusCode, StorageError};
use serde_json::Value;

/// Response of a stream operation.
///
/// Store failures are reported through `status` rather than as errors.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    /// Status code.
    pub status: StatusCode,
    /// Decrypted document, if any.
    pub content: Option<Value>,
    /// Etag of the stored document.
    pub etag: Option<String>,
    /// Cost of the operation.
    pub request_charge: f64,
    /// Failure message for unsuccessful responses.
    pub error_message: Option<String>,
}

impl ResponseMessage {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub(crate) fn from_error(err: &StorageError) -> Self {
        Self {
            status: err.status_code(),
            content: None,
            etag: None,
            request_charge: 0.0,
            error_message: Some(err.to_string()),
        }
    }
}

impl From<ItemResponse<Value>> for ResponseMessage {
    fn from(response: ItemResponse<Value>) -> Self {
        Self {
            status: response.status,
            content: response.resource,
            etag: response.etag,
            request_charge: response.request_charge,
            error_message: None,
        }
    }
}

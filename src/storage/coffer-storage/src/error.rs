//! Storage error types.

use thiserror::Error;

use crate::types::StatusCode;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entry not found.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Entry already exists.
    #[error("entry already exists: {0}")]
    Conflict(String),

    /// The supplied etag does not match the stored one.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The caller is not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Invalid input (bad identifiers, malformed documents, bad tokens).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Query execution failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Connection error.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Returns the status code a document database would answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NotFound,
            Self::Conflict(_) => StatusCode::Conflict,
            Self::PreconditionFailed(_) => StatusCode::PreconditionFailed,
            Self::Forbidden(_) => StatusCode::Forbidden,
            Self::InvalidInput(_) | Self::Serialization(_) => StatusCode::BadRequest,
            Self::QueryFailed(_) => StatusCode::InternalServerError,
            Self::ConnectionFailed(_) => StatusCode::ServiceUnavailable,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

//! # Coffer Container
//!
//! Encryption-aware facade over a [`coffer_storage::DocumentStore`].
//!
//! Writes are encrypted before they reach the store, either per operation
//! with [`coffer_encryption::EncryptionOptions`] or container-wide with the
//! container's client encryption policy. Reads, queries, change feeds and
//! batches are decrypted on the way back.
//!
//! Decryption failures are document scoped. With a
//! [`DecryptionResultHandler`] registered, a document that fails to decrypt
//! is handed to the handler still encrypted and its siblings are returned
//! normally. Without one, the failure is returned as an error.
//!
//! ## Example
//!
//! ```ignore
//! let container = Arc::new(store)
//!     .with_encryptor(encryptor)?
//!     .with_decryption_result_handler(|content: &Value, error: &EncryptionError| {
//!         tracing::error!(%error, "undecryptable document");
//!     });
//!
//! let options = EncryptionItemRequestOptions::encrypt(
//!     EncryptionOptions::new("dek1", algorithm, ["/ssn"]),
//! );
//! container.create_item(&customer, Some(&pk), Some(&options)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod container;
pub mod decryptable;
pub mod error;
pub mod feed;
pub mod handler;
pub mod reencryption;
pub mod response;

pub use batch::EncryptionTransactionalBatch;
pub use container::{EncryptionContainer, EncryptionItemRequestOptions, WithEncryptor};
pub use decryptable::DecryptableItem;
pub use error::ContainerError;
pub use feed::{DecryptableFeedResponse, EncryptionFeedIterator};
pub use handler::DecryptionResultHandler;
pub use reencryption::{
    ReencryptionFailure, ReencryptionFilter, ReencryptionIterator, ReencryptionOptions,
    ReencryptionResponse,
};
pub use response::ResponseMessage;

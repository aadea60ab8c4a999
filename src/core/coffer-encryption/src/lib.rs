//! # Coffer Encryption
//!
//! Field-level encryption of JSON documents.
//!
//! Selected paths of a document are serialized, encrypted under a data
//! encryption key and replaced in place by an opaque string. A reserved
//! `_ei` property records which paths were encrypted and how, so that a
//! reader can decrypt without knowing the schema:
//!
//! ```text
//! {
//!   "id": "1",
//!   "ssn": "BAKm...",
//!   "_ei": {
//!     "formatVersion": 2,
//!     "encryptedPaths": {
//!       "/ssn": { "dekId": "dek1", "algorithm": "AEAD_AES_256_GCM", "encryptionType": "Randomized" }
//!     }
//!   }
//! }
//! ```
//!
//! Paths come either from per-operation [`EncryptionOptions`] or from a
//! container-wide [`ClientEncryptionPolicy`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod encryptor;
pub mod error;
pub mod options;
pub mod path;
pub mod policy;
pub mod processor;

pub use encryptor::{DataEncryptionKeyProviderEncryptor, Encryptor};
pub use error::EncryptionError;
pub use options::EncryptionOptions;
pub use policy::{ClientEncryptionIncludedPath, ClientEncryptionPolicy};
pub use processor::{
    decrypt_document, encrypt_document, encrypt_document_with_policy, encrypt_query_parameter,
    DecryptionContext, DecryptionInfo, EncryptedPath, EncryptionProperties, TypeMarker,
    ENCRYPTION_FORMAT_VERSION, ENCRYPTION_PROPERTIES,
};

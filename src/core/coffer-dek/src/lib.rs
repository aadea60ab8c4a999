//! # Coffer DEK
//!
//! Data encryption keys (DEKs) for Coffer.
//!
//! DEK records live as ordinary documents in a dedicated container
//! partitioned by `/id`. Each record holds the DEK wrapped under a master
//! key; raw key bytes are only ever held in memory by the [`DekCache`],
//! for as long as the wrap provider allows.
//!
//! ## Example
//!
//! ```ignore
//! let provider = DataEncryptionKeyProvider::builder()
//!     .with_legacy_wrap_provider(Arc::new(VaultKeyWrapProvider::new(vault)))
//!     .build()?;
//! provider.initialize(Arc::new(keys_container)).await?;
//!
//! provider
//!     .data_encryption_key_container()
//!     .create_data_encryption_key("dek1", algorithm, metadata)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod container;
pub mod error;
pub mod properties;
pub mod provider;

pub use cache::{DekCache, DekCacheConfig};
pub use container::{
    DataEncryptionKeyContainer, DataEncryptionKeyFeedIterator, DataEncryptionKeyFeedResponse,
};
pub use error::DekError;
pub use properties::DataEncryptionKeyProperties;
pub use provider::{
    DataEncryptionKeyProvider, DataEncryptionKeyProviderBuilder, DataEncryptionKeyResolver,
};

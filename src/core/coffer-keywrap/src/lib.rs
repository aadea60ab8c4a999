//! # Coffer Key Wrap
//!
//! Wraps and unwraps data encryption keys under master keys.
//!
//! Two provider generations coexist:
//! - [`KeyWrapProvider`]: the legacy form. One key-encryption algorithm,
//!   and wrapping may rename the target metadata (e.g. to a versioned key id).
//! - [`KeyStoreProvider`]: the key store form. Several key-encryption
//!   algorithms, addressed by provider name and master key path, with
//!   sign/verify for master key metadata integrity. [`KeyStoreWrapProvider`]
//!   adapts it to wrap semantics.
//!
//! [`VaultKeyWrapProvider`] and [`VaultKeyStoreProvider`] realize both forms
//! over a [`coffer_keyvault::KeyVaultClient`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod keystore;
pub mod metadata;
pub mod provider;
pub mod vault;

pub use coffer_keyvault::KeyWrapAlgorithm;
pub use error::KeyWrapError;
pub use keystore::{KeyStoreProvider, KeyStoreWrapProvider};
pub use metadata::EncryptionKeyWrapMetadata;
pub use provider::{KeyUnwrapResult, KeyWrapProvider, KeyWrapResult, DEFAULT_CLIENT_CACHE_TTL};
pub use vault::{VaultKeyStoreProvider, VaultKeyWrapProvider, KEY_VAULT_METADATA_TYPE, KEY_VAULT_PROVIDER_NAME};

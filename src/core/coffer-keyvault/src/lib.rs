//! # Coffer Key Vault
//!
//! Access to the external key vault holding master keys (key-encryption
//! keys). Master keys never leave the vault: callers ask it to wrap,
//! unwrap, sign and verify.
//!
//! ## Implementations
//!
//! - [`LocalKeyVault`]: versioned master keys persisted through a
//!   [`coffer_storage::StorageBackend`], encrypted at rest under a root key
//! - [`HttpKeyVaultClient`]: REST client for a remote vault
//! - [`server::router`]: the same REST surface served from a local vault
//!
//! ## Key URIs
//!
//! Master keys are addressed as `{vault}/keys/{name}[/{version}]`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod http;
pub mod local;
pub mod server;
pub mod uri;
pub mod wire;

pub use client::{
    KeyAttributes, KeyType, KeyVaultClient, KeyVaultKey, KeyWrapAlgorithm, SignResult,
    UnwrapResult, WrapResult, PROTECTED_RECOVERY_LEVELS,
};
pub use error::KeyVaultError;
pub use http::HttpKeyVaultClient;
pub use local::{KeyOptions, LocalKeyVault};
pub use uri::KeyUri;

//! Key wrap metadata.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identifies the master key (and provider) that wraps a data encryption key.
///
/// Equality and hashing cover `type`, `value` and `algorithm`; `name` is a
/// display label only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyWrapMetadata {
    /// Provider type, e.g. `keyvault` or a key store provider name.
    #[serde(rename = "type")]
    pub type_: String,
    /// Friendly name of the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Provider-specific target, typically a master key URI.
    pub value: String,
    /// Key-encryption algorithm, when the provider supports several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

impl EncryptionKeyWrapMetadata {
    /// Creates metadata of the given type pointing at `value`.
    pub fn new(type_: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            name: None,
            value: value.into(),
            algorithm: None,
        }
    }

    /// Sets the friendly name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the key-encryption algorithm.
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }
}

impl PartialEq for EncryptionKeyWrapMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.type_ == other.type_ && self.value == other.value && self.algorithm == other.algorithm
    }
}

impl Eq for EncryptionKeyWrapMetadata {}

impl Hash for EncryptionKeyWrapMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_.hash(state);
        self.value.hash(state);
        self.algorithm.hash(state);
    }
}

//! DEK records.

use coffer_crypto::EncryptionAlgorithm;
use coffer_keywrap::EncryptionKeyWrapMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DekError;

/// A data encryption key as stored in the DEK container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEncryptionKeyProperties {
    /// Key id, unique within the container.
    pub id: String,
    /// Algorithm the key is used with.
    #[serde(rename = "encryptionAlgorithm")]
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Wrapped key bytes.
    #[serde(rename = "wrappedDataEncryptionKey", with = "base64_bytes")]
    pub wrapped_data_encryption_key: Vec<u8>,
    /// Master key that wrapped the key.
    #[serde(rename = "keyWrapMetadata")]
    pub encryption_key_wrap_metadata: EncryptionKeyWrapMetadata,
    /// Creation time (Unix seconds).
    #[serde(rename = "createTime", default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<u64>,
    /// Last modification time (Unix seconds), set by the store.
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    /// Concurrency token, set by the store.
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Self link, set by the store.
    #[serde(rename = "_self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

impl DataEncryptionKeyProperties {
    /// Creates a record for a freshly wrapped key.
    pub fn new(
        id: impl Into<String>,
        encryption_algorithm: EncryptionAlgorithm,
        wrapped_data_encryption_key: Vec<u8>,
        encryption_key_wrap_metadata: EncryptionKeyWrapMetadata,
        create_time: u64,
    ) -> Self {
        Self {
            id: id.into(),
            encryption_algorithm,
            wrapped_data_encryption_key,
            encryption_key_wrap_metadata,
            create_time: Some(create_time),
            last_modified: None,
            etag: None,
            self_link: None,
        }
    }

    /// Document body to write; store-managed properties are left out.
    pub(crate) fn to_document(&self) -> Result<Value, DekError> {
        let mut document = serde_json::to_value(Self {
            last_modified: None,
            etag: None,
            self_link: None,
            ..self.clone()
        })?;
        coffer_storage::strip_system_properties(&mut document);
        Ok(document)
    }

    pub(crate) fn from_document(document: Value) -> Result<Self, DekError> {
        Ok(serde_json::from_value(document)?)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

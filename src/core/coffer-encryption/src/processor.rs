//! Field-path encryption of documents.
//!
//! Each encrypted value is stored as a base64 string:
//!
//! ```text
//! type marker (1 byte) || cell ciphertext of (type marker || value bytes)
//! ```
//!
//! The type marker restores the exact JSON type on decrypt, so integers stay
//! integers and floats stay floats. The sealed copy authenticates the
//! visible one. Objects and arrays are encrypted whole.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use coffer_crypto::{EncryptionAlgorithm, EncryptionType};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::debug;
use zeroize::Zeroizing;

use crate::encryptor::Encryptor;
use crate::error::EncryptionError;
use crate::options::EncryptionOptions;
use crate::path;
use crate::policy::{ClientEncryptionIncludedPath, ClientEncryptionPolicy};

pub use crate::path::ENCRYPTION_PROPERTIES;

/// Version of the `_ei` side channel written by this crate.
pub const ENCRYPTION_FORMAT_VERSION: u32 = 2;

/// JSON type of an encrypted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeMarker {
    /// `null`. Null values are never encrypted.
    Null = 1,
    /// `true` or `false`.
    Boolean = 2,
    /// Number with a fractional part or exponent.
    Double = 3,
    /// Signed 64-bit integer.
    Long = 4,
    /// String.
    String = 5,
    /// Array, serialized as JSON.
    Array = 6,
    /// Object, serialized as JSON.
    Object = 7,
    /// Integer above `i64::MAX`.
    UnsignedLong = 8,
}

impl TryFrom<u8> for TypeMarker {
    type Error = EncryptionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Null,
            2 => Self::Boolean,
            3 => Self::Double,
            4 => Self::Long,
            5 => Self::String,
            6 => Self::Array,
            7 => Self::Object,
            8 => Self::UnsignedLong,
            other => {
                return Err(EncryptionError::InvalidDocument(format!(
                    "unknown type marker {other}"
                )))
            }
        })
    }
}

/// How one path was encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPath {
    /// DEK the value was encrypted with.
    #[serde(rename = "dekId")]
    pub data_encryption_key_id: String,
    /// Cell algorithm.
    pub algorithm: EncryptionAlgorithm,
    /// Randomized or deterministic.
    pub encryption_type: EncryptionType,
}

impl From<&ClientEncryptionIncludedPath> for EncryptedPath {
    fn from(included: &ClientEncryptionIncludedPath) -> Self {
        Self {
            data_encryption_key_id: included.client_encryption_key_id.clone(),
            algorithm: included.encryption_algorithm,
            encryption_type: included.encryption_type,
        }
    }
}

/// The `_ei` side channel of an encrypted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionProperties {
    /// Side channel format version.
    pub format_version: u32,
    /// Encrypted paths.
    pub encrypted_paths: BTreeMap<String, EncryptedPath>,
}

/// Paths decrypted with one DEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionInfo {
    /// DEK id.
    pub data_encryption_key_id: String,
    /// Paths decrypted with it.
    pub paths_decrypted: Vec<String>,
}

/// What a successful decrypt did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptionContext {
    /// One entry per DEK used.
    pub decryption_info: Vec<DecryptionInfo>,
}

// ============================================================================
// Value serialization
// ============================================================================

fn serialize(value: &Value) -> Result<(TypeMarker, Zeroizing<Vec<u8>>), EncryptionError> {
    let (marker, bytes) = match value {
        Value::Null => (TypeMarker::Null, Vec::new()),
        Value::Bool(b) => (TypeMarker::Boolean, vec![u8::from(*b)]),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                (TypeMarker::Long, i.to_be_bytes().to_vec())
            } else if let Some(u) = n.as_u64() {
                (TypeMarker::UnsignedLong, u.to_be_bytes().to_vec())
            } else if let Some(f) = n.as_f64() {
                (TypeMarker::Double, f.to_be_bytes().to_vec())
            } else {
                return Err(EncryptionError::Serialization(format!("unsupported number {n}")));
            }
        }
        Value::String(s) => (TypeMarker::String, s.as_bytes().to_vec()),
        Value::Array(_) => (TypeMarker::Array, serde_json::to_vec(value)?),
        Value::Object(_) => (TypeMarker::Object, serde_json::to_vec(value)?),
    };
    Ok((marker, Zeroizing::new(bytes)))
}

fn fixed<const N: usize>(bytes: &[u8], marker: TypeMarker) -> Result<[u8; N], EncryptionError> {
    bytes.try_into().map_err(|_| {
        EncryptionError::Serialization(format!(
            "{:?} value must be {} bytes, got {}",
            marker,
            N,
            bytes.len()
        ))
    })
}

fn deserialize(marker: TypeMarker, bytes: &[u8]) -> Result<Value, EncryptionError> {
    let value = match marker {
        TypeMarker::Null => Value::Null,
        TypeMarker::Boolean => match bytes {
            [0] => Value::Bool(false),
            [1] => Value::Bool(true),
            _ => return Err(EncryptionError::Serialization("malformed boolean".to_string())),
        },
        TypeMarker::Long => Value::from(i64::from_be_bytes(fixed(bytes, marker)?)),
        TypeMarker::UnsignedLong => Value::from(u64::from_be_bytes(fixed(bytes, marker)?)),
        TypeMarker::Double => {
            let f = f64::from_be_bytes(fixed(bytes, marker)?);
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| EncryptionError::Serialization(format!("non-finite double {f}")))?
        }
        TypeMarker::String => Value::String(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| EncryptionError::Serialization(e.to_string()))?,
        ),
        TypeMarker::Array | TypeMarker::Object => {
            let value: Value = serde_json::from_slice(bytes)?;
            let matches = match marker {
                TypeMarker::Array => value.is_array(),
                _ => value.is_object(),
            };
            if !matches {
                return Err(EncryptionError::Serialization(format!(
                    "decrypted value does not match type marker {marker:?}"
                )));
            }
            value
        }
    };
    Ok(value)
}

// ============================================================================
// Encryption
// ============================================================================

async fn encrypt_value(
    value: &Value,
    target: &EncryptedPath,
    encryptor: &dyn Encryptor,
) -> Result<String, EncryptionError> {
    let (marker, bytes) = serialize(value)?;
    let mut plaintext = Zeroizing::new(Vec::with_capacity(1 + bytes.len()));
    plaintext.push(marker as u8);
    plaintext.extend_from_slice(&bytes);

    let ciphertext = encryptor
        .encrypt(
            &plaintext,
            &target.data_encryption_key_id,
            target.algorithm,
            target.encryption_type,
        )
        .await?;

    let mut payload = Vec::with_capacity(1 + ciphertext.len());
    payload.push(marker as u8);
    payload.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(payload))
}

async fn encrypt_paths(
    mut document: Value,
    targets: Vec<(String, EncryptedPath)>,
    encryptor: &dyn Encryptor,
) -> Result<Value, EncryptionError> {
    let Some(map) = document.as_object() else {
        return Err(EncryptionError::InvalidDocument(
            "document must be a JSON object".to_string(),
        ));
    };
    if map.contains_key(ENCRYPTION_PROPERTIES) {
        return Err(EncryptionError::InvalidDocument(format!(
            "document already carries the reserved {ENCRYPTION_PROPERTIES} property"
        )));
    }

    // Absent and null values are left as they are
    let work: Vec<_> = targets
        .into_iter()
        .filter_map(|(p, target)| {
            let value = path::value_at(&document, &p).filter(|v| !v.is_null())?;
            Some((p, target, value))
        })
        .collect();

    let encrypted = try_join_all(work.into_iter().map(|(p, target, value)| async move {
        let ciphertext = encrypt_value(value, &target, encryptor).await?;
        Ok::<_, EncryptionError>((p, target, ciphertext))
    }))
    .await?;

    if encrypted.is_empty() {
        return Ok(document);
    }

    let mut properties = EncryptionProperties {
        format_version: ENCRYPTION_FORMAT_VERSION,
        encrypted_paths: BTreeMap::new(),
    };
    for (p, target, ciphertext) in encrypted {
        if let Some(slot) = path::value_at_mut(&mut document, &p) {
            *slot = Value::String(ciphertext);
        }
        properties.encrypted_paths.insert(p, target);
    }

    debug!(paths = properties.encrypted_paths.len(), "Document encrypted");

    let properties = serde_json::to_value(&properties)?;
    if let Value::Object(map) = &mut document {
        map.insert(ENCRYPTION_PROPERTIES.to_string(), properties);
    }
    Ok(document)
}

/// Encrypts the paths named by `options`.
///
/// The options are validated against `partition_key_paths` before any
/// encryption call. Paths missing from the document, or holding `null`, are
/// skipped.
pub async fn encrypt_document(
    document: Value,
    options: &EncryptionOptions,
    partition_key_paths: &[String],
    encryptor: &dyn Encryptor,
) -> Result<Value, EncryptionError> {
    let paths = options.validate(partition_key_paths)?;
    let target = EncryptedPath {
        data_encryption_key_id: options.data_encryption_key_id.clone(),
        algorithm: options.encryption_algorithm,
        encryption_type: options.encryption_type,
    };

    let targets = paths.into_iter().map(|p| (p, target.clone())).collect();
    encrypt_paths(document, targets, encryptor).await
}

/// Encrypts the paths of a validated container policy.
pub async fn encrypt_document_with_policy(
    document: Value,
    policy: &ClientEncryptionPolicy,
    encryptor: &dyn Encryptor,
) -> Result<Value, EncryptionError> {
    let targets = policy
        .included_paths
        .iter()
        .map(|included| (included.path.clone(), EncryptedPath::from(included)))
        .collect();
    encrypt_paths(document, targets, encryptor).await
}

/// Encrypts a query parameter compared against a policy path.
///
/// Only deterministically encrypted paths can be queried for equality;
/// `null` stays `null`.
pub async fn encrypt_query_parameter(
    policy: &ClientEncryptionPolicy,
    path: &str,
    value: &Value,
    encryptor: &dyn Encryptor,
) -> Result<Value, EncryptionError> {
    let included = policy
        .included_path(path)
        .ok_or_else(|| EncryptionError::invalid_path(path, "not encrypted by the policy"))?;

    if included.encryption_type != EncryptionType::Deterministic {
        return Err(EncryptionError::InvalidOperation(format!(
            "path {path} uses randomized encryption and cannot be queried"
        )));
    }
    if value.is_null() {
        return Ok(Value::Null);
    }

    Ok(Value::String(
        encrypt_value(value, &EncryptedPath::from(included), encryptor).await?,
    ))
}

// ============================================================================
// Decryption
// ============================================================================

async fn decrypt_value(
    value: &Value,
    target: &EncryptedPath,
    encryptor: &dyn Encryptor,
) -> Result<Value, EncryptionError> {
    let encoded = value.as_str().ok_or_else(|| {
        EncryptionError::InvalidDocument("encrypted value must be a string".to_string())
    })?;
    let payload = STANDARD
        .decode(encoded)
        .map_err(|e| EncryptionError::InvalidDocument(format!("encrypted value is not base64: {e}")))?;
    let (&marker, ciphertext) = payload
        .split_first()
        .ok_or_else(|| EncryptionError::InvalidDocument("empty encrypted value".to_string()))?;
    let marker = TypeMarker::try_from(marker)?;

    let plaintext = encryptor
        .decrypt(ciphertext, &target.data_encryption_key_id, target.algorithm)
        .await?;
    match plaintext.split_first() {
        Some((&sealed, bytes)) if sealed == marker as u8 => deserialize(marker, bytes),
        _ => Err(EncryptionError::InvalidDocument(format!(
            "type marker {marker:?} does not match the encrypted value"
        ))),
    }
}

/// Decrypts every path recorded in the document's side channel.
///
/// A document without a side channel is returned unchanged with no
/// context. On failure the error is
/// [`EncryptionError::DecryptionFailed`], carrying the failing DEK id and
/// the still-encrypted document.
pub async fn decrypt_document(
    mut document: Value,
    encryptor: &dyn Encryptor,
) -> Result<(Value, Option<DecryptionContext>), EncryptionError> {
    let Some(raw) = document.get(ENCRYPTION_PROPERTIES) else {
        return Ok((document, None));
    };

    let properties: EncryptionProperties = serde_json::from_value(raw.clone()).map_err(|e| {
        EncryptionError::InvalidDocument(format!("malformed {ENCRYPTION_PROPERTIES}: {e}"))
    })?;
    if properties.format_version != ENCRYPTION_FORMAT_VERSION {
        return Err(EncryptionError::InvalidDocument(format!(
            "unsupported encryption format version {}",
            properties.format_version
        )));
    }

    let encrypted = &document;
    let decrypted = try_join_all(properties.encrypted_paths.iter().filter_map(|(p, target)| {
        let value = path::value_at(encrypted, p)?;
        Some(async move {
            match decrypt_value(value, target, encryptor).await {
                Ok(plain) => Ok((p.as_str(), target.data_encryption_key_id.as_str(), plain)),
                Err(source) => Err(EncryptionError::DecryptionFailed {
                    data_encryption_key_id: target.data_encryption_key_id.clone(),
                    encrypted_content: Box::new(encrypted.clone()),
                    source: Box::new(source),
                }),
            }
        })
    }))
    .await?;

    let mut by_key: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (p, key_id, plain) in decrypted {
        if let Some(slot) = path::value_at_mut(&mut document, p) {
            *slot = plain;
        }
        by_key.entry(key_id).or_default().push(p.to_string());
    }
    if let Value::Object(map) = &mut document {
        map.remove(ENCRYPTION_PROPERTIES);
    }

    let context = DecryptionContext {
        decryption_info: by_key
            .into_iter()
            .map(|(id, paths_decrypted)| DecryptionInfo {
                data_encryption_key_id: id.to_string(),
                paths_decrypted,
            })
            .collect(),
    };
    Ok((document, Some(context)))
}

//! Container-wide client encryption policy.

use std::collections::HashSet;

use coffer_crypto::{EncryptionAlgorithm, EncryptionType};
use coffer_storage::ContainerProperties;
use serde::{Deserialize, Serialize};

use crate::error::EncryptionError;
use crate::path;

/// Policy format versions this crate understands.
const SUPPORTED_FORMAT_VERSIONS: [u32; 2] = [1, 2];

/// One encrypted path of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEncryptionIncludedPath {
    /// Top-level path, e.g. `/ssn`.
    pub path: String,
    /// DEK encrypting the path.
    pub client_encryption_key_id: String,
    /// Randomized or deterministic.
    pub encryption_type: EncryptionType,
    /// Cell algorithm.
    pub encryption_algorithm: EncryptionAlgorithm,
}

impl ClientEncryptionIncludedPath {
    /// Creates an included path.
    pub fn new(
        path: impl Into<String>,
        client_encryption_key_id: impl Into<String>,
        encryption_type: EncryptionType,
        encryption_algorithm: EncryptionAlgorithm,
    ) -> Self {
        Self {
            path: path.into(),
            client_encryption_key_id: client_encryption_key_id.into(),
            encryption_type,
            encryption_algorithm,
        }
    }
}

/// Declares which paths of every document in a container are encrypted.
///
/// A policy is fixed when the container is created. Changing it means
/// creating a new container and re-encrypting into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEncryptionPolicy {
    /// Encrypted paths.
    pub included_paths: Vec<ClientEncryptionIncludedPath>,
    /// Policy format version.
    pub policy_format_version: u32,
}

impl ClientEncryptionPolicy {
    /// Creates a version 1 policy.
    pub fn new(included_paths: Vec<ClientEncryptionIncludedPath>) -> Self {
        Self {
            included_paths,
            policy_format_version: 1,
        }
    }

    /// Reads the policy attached to a container, if any.
    pub fn from_container_properties(
        properties: &ContainerProperties,
    ) -> Result<Option<Self>, EncryptionError> {
        properties
            .client_encryption_policy
            .as_ref()
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| EncryptionError::InvalidPolicy(e.to_string()))
            })
            .transpose()
    }

    /// Serializes the policy for [`ContainerProperties::with_client_encryption_policy`].
    pub fn to_value(&self) -> Result<serde_json::Value, EncryptionError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Validates the policy for a container partitioned by
    /// `partition_key_paths`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown format version, nested or restricted paths,
    /// duplicated paths, an empty key id, or deterministic encryption with an
    /// algorithm that does not support it.
    pub fn validate(&self, partition_key_paths: &[String]) -> Result<(), EncryptionError> {
        if !SUPPORTED_FORMAT_VERSIONS.contains(&self.policy_format_version) {
            return Err(EncryptionError::InvalidPolicy(format!(
                "unsupported policy format version {}",
                self.policy_format_version
            )));
        }

        let mut seen = HashSet::new();
        for included in &self.included_paths {
            path::validate(&included.path, partition_key_paths)?;

            if included.path[1..].contains('/') {
                return Err(EncryptionError::invalid_path(
                    &included.path,
                    "only top-level paths are supported by a policy",
                ));
            }
            if !seen.insert(included.path.as_str()) {
                return Err(EncryptionError::invalid_path(&included.path, "duplicate path"));
            }
            if included.client_encryption_key_id.is_empty() {
                return Err(EncryptionError::InvalidPolicy(format!(
                    "path {} has no client encryption key id",
                    included.path
                )));
            }
            if included.encryption_type == EncryptionType::Deterministic
                && !included.encryption_algorithm.supports_deterministic()
            {
                return Err(EncryptionError::InvalidPolicy(format!(
                    "path {}: {} does not support deterministic encryption",
                    included.path, included.encryption_algorithm
                )));
            }
        }

        Ok(())
    }

    /// Included path entry for `path`.
    pub fn included_path(&self, path: &str) -> Option<&ClientEncryptionIncludedPath> {
        self.included_paths.iter().find(|p| p.path == path)
    }
}

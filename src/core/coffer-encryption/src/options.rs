//! Per-operation encryption options.

use coffer_crypto::{EncryptionAlgorithm, EncryptionType};

use crate::error::EncryptionError;
use crate::path;

/// Which paths of a document to encrypt, and with which key.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionOptions {
    /// DEK used for every path.
    pub data_encryption_key_id: String,
    /// Cell algorithm.
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Randomized or deterministic.
    pub encryption_type: EncryptionType,
    /// Paths to encrypt. Order does not matter and duplicates are ignored.
    pub paths_to_encrypt: Vec<String>,
}

impl EncryptionOptions {
    /// Randomized encryption of `paths` under one DEK.
    pub fn new<I, S>(
        data_encryption_key_id: impl Into<String>,
        encryption_algorithm: EncryptionAlgorithm,
        paths: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            data_encryption_key_id: data_encryption_key_id.into(),
            encryption_algorithm,
            encryption_type: EncryptionType::Randomized,
            paths_to_encrypt: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Sets the encryption type.
    pub fn with_encryption_type(mut self, encryption_type: EncryptionType) -> Self {
        self.encryption_type = encryption_type;
        self
    }

    /// Validates the options for a container partitioned by
    /// `partition_key_paths` and returns the paths to process.
    ///
    /// # Errors
    ///
    /// Fails on an empty key id, an empty path list, a restricted or
    /// malformed path, or deterministic encryption with an algorithm that
    /// does not support it.
    pub fn validate(&self, partition_key_paths: &[String]) -> Result<Vec<String>, EncryptionError> {
        if self.data_encryption_key_id.is_empty() {
            return Err(EncryptionError::InvalidOptions(
                "data encryption key id cannot be empty".to_string(),
            ));
        }

        if self.paths_to_encrypt.is_empty() {
            return Err(EncryptionError::InvalidOptions(
                "at least one path to encrypt is required".to_string(),
            ));
        }

        if self.encryption_type == EncryptionType::Deterministic
            && !self.encryption_algorithm.supports_deterministic()
        {
            return Err(EncryptionError::InvalidOptions(format!(
                "{} does not support deterministic encryption",
                self.encryption_algorithm
            )));
        }

        for p in &self.paths_to_encrypt {
            path::validate(p, partition_key_paths)?;
        }

        Ok(path::normalize(self.paths_to_encrypt.iter().map(String::as_str)))
    }
}

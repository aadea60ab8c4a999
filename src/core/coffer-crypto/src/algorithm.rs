//! Encryption algorithm identifiers.
//!
//! Data encryption keys belong to one of two incompatible algorithm
//! families. The family decides how a raw key is turned into cell keys and
//! which wrap provider is able to unwrap it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Wire identifier of [`EncryptionAlgorithm::LegacyAeadAes256Gcm`].
pub const LEGACY_AEAD_AES_256_GCM: &str = "AEAD_AES_256_GCM";

/// Wire identifier of [`EncryptionAlgorithm::AeadAes256GcmHmacSha256`].
pub const AEAD_AES_256_GCM_HMAC_SHA256: &str = "AEAD_AES_256_GCM_HMAC_SHA256";

/// Algorithm families. Payloads of different families are not bit-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmFamily {
    /// Single master-key algorithm, raw key used directly.
    Legacy,
    /// Key store based, subkeys derived from the raw key.
    KeyStore,
}

impl std::fmt::Display for AlgorithmFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::KeyStore => write!(f, "key-store"),
        }
    }
}

/// Cell encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM keyed directly by the data encryption key.
    LegacyAeadAes256Gcm,
    /// AES-256-GCM with HKDF-derived subkeys and HMAC-SHA256 synthetic nonces.
    AeadAes256GcmHmacSha256,
}

impl EncryptionAlgorithm {
    /// Returns the family this algorithm belongs to.
    pub fn family(self) -> AlgorithmFamily {
        match self {
            Self::LegacyAeadAes256Gcm => AlgorithmFamily::Legacy,
            Self::AeadAes256GcmHmacSha256 => AlgorithmFamily::KeyStore,
        }
    }

    /// Returns the wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacyAeadAes256Gcm => LEGACY_AEAD_AES_256_GCM,
            Self::AeadAes256GcmHmacSha256 => AEAD_AES_256_GCM_HMAC_SHA256,
        }
    }

    /// Returns whether deterministic encryption is available.
    pub fn supports_deterministic(self) -> bool {
        self.family() == AlgorithmFamily::KeyStore
    }
}

impl std::fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            LEGACY_AEAD_AES_256_GCM => Ok(Self::LegacyAeadAes256Gcm),
            AEAD_AES_256_GCM_HMAC_SHA256 => Ok(Self::AeadAes256GcmHmacSha256),
            _ => Err(CryptoError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for EncryptionAlgorithm {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EncryptionAlgorithm> for String {
    fn from(value: EncryptionAlgorithm) -> Self {
        value.as_str().to_string()
    }
}

/// Randomized or deterministic cell encryption.
///
/// Deterministic encryption yields identical ciphertext for identical
/// plaintext under the same key, which makes equality queries possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptionType {
    /// Fresh random nonce per encryption.
    #[default]
    Randomized,
    /// Nonce derived from the plaintext.
    Deterministic,
}

impl std::fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Randomized => write!(f, "Randomized"),
            Self::Deterministic => write!(f, "Deterministic"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for algorithm in [
            EncryptionAlgorithm::LegacyAeadAes256Gcm,
            EncryptionAlgorithm::AeadAes256GcmHmacSha256,
        ] {
            assert_eq!(
                algorithm.to_string().parse::<EncryptionAlgorithm>().unwrap(),
                algorithm
            );
        }
        assert!(matches!(
            "AES_128_CBC".parse::<EncryptionAlgorithm>(),
            Err(CryptoError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_serde_uses_wire_identifier() {
        let json = serde_json::to_string(&EncryptionAlgorithm::AeadAes256GcmHmacSha256).unwrap();
        assert_eq!(json, "\"AEAD_AES_256_GCM_HMAC_SHA256\"");

        let parsed: EncryptionAlgorithm = serde_json::from_str("\"AEAD_AES_256_GCM\"").unwrap();
        assert_eq!(parsed, EncryptionAlgorithm::LegacyAeadAes256Gcm);
    }

    #[test]
    fn test_families() {
        assert_eq!(
            EncryptionAlgorithm::LegacyAeadAes256Gcm.family(),
            AlgorithmFamily::Legacy
        );
        assert!(!EncryptionAlgorithm::LegacyAeadAes256Gcm.supports_deterministic());
        assert!(EncryptionAlgorithm::AeadAes256GcmHmacSha256.supports_deterministic());
    }
}

//! Cell ciphers.
//!
//! A cell cipher encrypts a single serialized document value under a raw
//! data encryption key. Output format:
//!
//! ```text
//! version (1 byte) || nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! The version byte identifies the algorithm family and is bound as
//! associated data.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::{self, AeadCipher, KEY_SIZE, NONCE_SIZE};
use crate::algorithm::{AlgorithmFamily, EncryptionAlgorithm, EncryptionType};
use crate::error::CryptoError;
use crate::kdf::derive_cell_keys;
use crate::random::generate_nonce;

/// Format version of legacy cell ciphertext.
pub const LEGACY_VERSION: u8 = 0x01;

/// Format version of key store cell ciphertext.
pub const KEY_STORE_VERSION: u8 = 0x02;

fn version_for(algorithm: EncryptionAlgorithm) -> u8 {
    match algorithm.family() {
        AlgorithmFamily::Legacy => LEGACY_VERSION,
        AlgorithmFamily::KeyStore => KEY_STORE_VERSION,
    }
}

/// Encrypts and decrypts cell values under one data encryption key.
pub struct CellCipher {
    algorithm: EncryptionAlgorithm,
    encryption_key: Zeroizing<[u8; KEY_SIZE]>,
    iv_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl CellCipher {
    /// Builds a cipher from raw data encryption key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the raw key is not exactly 32 bytes.
    pub fn new(raw_key: &[u8], algorithm: EncryptionAlgorithm) -> Result<Self, CryptoError> {
        aead::check_key(raw_key)?;

        match algorithm.family() {
            AlgorithmFamily::Legacy => {
                let mut encryption_key = Zeroizing::new([0u8; KEY_SIZE]);
                encryption_key.copy_from_slice(raw_key);
                Ok(Self {
                    algorithm,
                    encryption_key,
                    iv_key: None,
                })
            }
            AlgorithmFamily::KeyStore => {
                let keys = derive_cell_keys(raw_key)?;
                Ok(Self {
                    algorithm,
                    encryption_key: keys.encryption,
                    iv_key: Some(keys.iv),
                })
            }
        }
    }

    /// Returns the algorithm this cipher was built for.
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Encrypts a serialized value.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        encryption_type: EncryptionType,
    ) -> Result<Vec<u8>, CryptoError> {
        let version = version_for(self.algorithm);

        let nonce = match (encryption_type, &self.iv_key) {
            (EncryptionType::Randomized, _) => generate_nonce(),
            (EncryptionType::Deterministic, Some(iv_key)) => {
                synthetic_nonce(iv_key.as_slice(), version, plaintext)?
            }
            (EncryptionType::Deterministic, None) => {
                return Err(CryptoError::UnsupportedEncryptionType {
                    encryption_type: encryption_type.to_string(),
                    algorithm: self.algorithm.to_string(),
                })
            }
        };

        let body = aead::seal_with_nonce(
            AeadCipher::Aes256Gcm,
            self.encryption_key.as_slice(),
            &nonce,
            plaintext,
            &[version],
        )?;

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(version);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decrypts a cell ciphertext.
    ///
    /// Data produced under the other algorithm family is rejected before any
    /// decryption is attempted.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let (&version, body) = ciphertext
            .split_first()
            .ok_or_else(|| CryptoError::InvalidInput("empty cell ciphertext".to_string()))?;

        let expected = version_for(self.algorithm);
        if version != expected {
            let found = match version {
                LEGACY_VERSION => EncryptionAlgorithm::LegacyAeadAes256Gcm.to_string(),
                KEY_STORE_VERSION => EncryptionAlgorithm::AeadAes256GcmHmacSha256.to_string(),
                other => {
                    return Err(CryptoError::InvalidInput(format!(
                        "unknown cell format version: {}",
                        other
                    )))
                }
            };
            return Err(CryptoError::AlgorithmMismatch {
                expected: self.algorithm.to_string(),
                found,
            });
        }

        aead::open(AeadCipher::Aes256Gcm, self.encryption_key.as_slice(), body, &[version])
    }
}

impl std::fmt::Debug for CellCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellCipher")
            .field("algorithm", &self.algorithm)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn synthetic_nonce(
    iv_key: &[u8],
    version: u8,
    plaintext: &[u8],
) -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(iv_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(&[version]);
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    Ok(nonce)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::random::generate_key;

    fn key_store_cipher() -> CellCipher {
        CellCipher::new(&*generate_key(), EncryptionAlgorithm::AeadAes256GcmHmacSha256).unwrap()
    }

    #[test]
    fn test_roundtrip_both_families() {
        let raw = generate_key();
        for algorithm in [
            EncryptionAlgorithm::LegacyAeadAes256Gcm,
            EncryptionAlgorithm::AeadAes256GcmHmacSha256,
        ] {
            let cipher = CellCipher::new(&*raw, algorithm).unwrap();
            let ciphertext = cipher.encrypt(b"4111-1111", EncryptionType::Randomized).unwrap();
            assert_eq!(&*cipher.decrypt(&ciphertext).unwrap(), b"4111-1111");
        }
    }

    #[test]
    fn test_deterministic_is_stable() {
        let cipher = key_store_cipher();

        let a = cipher.encrypt(b"alice", EncryptionType::Deterministic).unwrap();
        let b = cipher.encrypt(b"alice", EncryptionType::Deterministic).unwrap();
        let c = cipher.encrypt(b"bob", EncryptionType::Deterministic).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_randomized_differs() {
        let cipher = key_store_cipher();

        let a = cipher.encrypt(b"alice", EncryptionType::Randomized).unwrap();
        let b = cipher.encrypt(b"alice", EncryptionType::Randomized).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_legacy_rejects_deterministic() {
        let cipher =
            CellCipher::new(&*generate_key(), EncryptionAlgorithm::LegacyAeadAes256Gcm).unwrap();

        let result = cipher.encrypt(b"x", EncryptionType::Deterministic);
        assert!(matches!(
            result,
            Err(CryptoError::UnsupportedEncryptionType { .. })
        ));
    }

    #[test]
    fn test_family_mismatch_fails_fast() {
        let raw = generate_key();
        let legacy = CellCipher::new(&*raw, EncryptionAlgorithm::LegacyAeadAes256Gcm).unwrap();
        let key_store = CellCipher::new(&*raw, EncryptionAlgorithm::AeadAes256GcmHmacSha256).unwrap();

        let ciphertext = legacy.encrypt(b"value", EncryptionType::Randomized).unwrap();
        let err = key_store.decrypt(&ciphertext).unwrap_err();

        assert!(matches!(err, CryptoError::AlgorithmMismatch { .. }));
        assert!(err.to_string().contains("AEAD_AES_256_GCM"));
    }

    #[test]
    fn test_version_byte_is_authenticated() {
        let cipher = key_store_cipher();
        let mut ciphertext = cipher.encrypt(b"value", EncryptionType::Randomized).unwrap();
        ciphertext[0] = 0x7f;

        assert!(matches!(
            cipher.decrypt(&ciphertext),
            Err(CryptoError::InvalidInput(_))
        ));
        assert!(cipher.decrypt(&[]).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = key_store_cipher()
            .encrypt(b"value", EncryptionType::Randomized)
            .unwrap();

        assert!(matches!(
            key_store_cipher().decrypt(&ciphertext),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }
}

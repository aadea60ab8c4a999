//! Authenticated encryption with a self-describing nonce.
//!
//! Sealed data is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! Associated data is mandatory: every caller binds its ciphertext to a
//! context such as a key version or a cell format byte.

use aes_gcm::aead::{consts::U12, Aead, AeadCore, KeyInit, Nonce, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::generate_nonce;

/// Size of a key in bytes, for both ciphers.
pub const KEY_SIZE: usize = 32;

/// Size of a nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of an authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// AEAD cipher choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeadCipher {
    /// AES-256-GCM.
    #[default]
    Aes256Gcm,
    /// ChaCha20-Poly1305.
    ChaCha20Poly1305,
}

pub(crate) fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

/// Seals `plaintext` under a fresh random nonce.
pub fn seal(
    cipher: AeadCipher,
    key: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    seal_with_nonce(cipher, key, &generate_nonce(), plaintext, aad)
}

/// Seals `plaintext` under a caller-chosen nonce.
///
/// A nonce must never be reused for different plaintext under one key.
/// Deterministic cell encryption satisfies this by deriving the nonce from
/// the plaintext.
pub fn seal_with_nonce(
    cipher: AeadCipher,
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    let sealed = match cipher {
        AeadCipher::Aes256Gcm => seal_in::<Aes256Gcm>(key, nonce, plaintext, aad),
        AeadCipher::ChaCha20Poly1305 => seal_in::<ChaCha20Poly1305>(key, nonce, plaintext, aad),
    }?;

    let mut framed = Vec::with_capacity(NONCE_SIZE + sealed.len());
    framed.extend_from_slice(nonce);
    framed.extend_from_slice(&sealed);
    Ok(framed)
}

/// Opens data produced by [`seal`] or [`seal_with_nonce`].
pub fn open(
    cipher: AeadCipher,
    key: &[u8],
    framed: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    check_key(key)?;
    if framed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "sealed data is {} bytes, shorter than nonce and tag",
            framed.len()
        )));
    }

    let (nonce, sealed) = framed.split_at(NONCE_SIZE);
    let plaintext = match cipher {
        AeadCipher::Aes256Gcm => open_in::<Aes256Gcm>(key, nonce, sealed, aad),
        AeadCipher::ChaCha20Poly1305 => open_in::<ChaCha20Poly1305>(key, nonce, sealed, aad),
    }?;
    Ok(Zeroizing::new(plaintext))
}

fn seal_in<C>(key: &[u8], nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    C::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
        .encrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

fn open_in<C>(key: &[u8], nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    C::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
        .decrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::DecryptionFailed("authentication failed".to_string()))
}

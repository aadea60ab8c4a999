//! HKDF-SHA256 key derivation (RFC 5869).

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;

const CELL_ENCRYPTION_INFO: &[u8] = b"coffer-cell-v1:encryption";
const CELL_IV_INFO: &[u8] = b"coffer-cell-v1:iv";

/// Expands `ikm` into `length` bytes.
pub fn derive_key(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 || length > 255 * 32 {
        return Err(CryptoError::InvalidInput(format!(
            "HKDF-SHA256 cannot produce {length} bytes"
        )));
    }

    let mut okm = Zeroizing::new(vec![0u8; length]);
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyGenerationFailed("HKDF expansion failed".to_string()))?;
    Ok(okm)
}

/// Derives a 256-bit subkey of `key` for the purpose named by `info`.
pub fn derive_subkey(key: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let okm = derive_key(key, None, info, KEY_SIZE)?;
    let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
    subkey.copy_from_slice(&okm);
    Ok(subkey)
}

/// Subkeys of a key-store family data encryption key.
pub struct CellKeys {
    /// AEAD key for values.
    pub encryption: Zeroizing<[u8; KEY_SIZE]>,
    /// HMAC key deriving synthetic nonces for deterministic encryption.
    pub iv: Zeroizing<[u8; KEY_SIZE]>,
}

/// Splits a raw data encryption key into its cell subkeys.
pub fn derive_cell_keys(dek: &[u8]) -> Result<CellKeys, CryptoError> {
    Ok(CellKeys {
        encryption: derive_subkey(dek, CELL_ENCRYPTION_INFO)?,
        iv: derive_subkey(dek, CELL_IV_INFO)?,
    })
}

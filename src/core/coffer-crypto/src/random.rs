//! Key and nonce generation from the OS CSPRNG.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{KEY_SIZE, NONCE_SIZE};

/// Fresh 256-bit key material.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

/// Fresh 96-bit AEAD nonce for randomized encryption.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

//! # Coffer Crypto
//!
//! Cryptographic primitives for Coffer.
//!
//! This crate provides the low-level building blocks of the envelope encryption scheme:
//! - Symmetric encryption (AES-256-GCM, ChaCha20-Poly1305)
//! - Key derivation (HKDF-SHA256)
//! - Secure random generation
//! - Cell ciphers that encrypt individual document values under a data encryption key

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod algorithm;
pub mod cell;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;

pub use aead::AeadCipher;
pub use algorithm::{AlgorithmFamily, EncryptionAlgorithm, EncryptionType};
pub use cell::CellCipher;
pub use error::CryptoError;
pub use keys::{DataEncryptionKey, MasterKey};

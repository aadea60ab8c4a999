//! Decryption failure handlers.

use coffer_encryption::EncryptionError;
use serde_json::Value;

/// Receives documents that could not be decrypted.
///
/// `encrypted_content` is the document as stored. It is also what the
/// container returns in place of the decrypted document.
pub trait DecryptionResultHandler: Send + Sync {
    /// Called once per failing document.
    fn handle(&self, encrypted_content: &Value, error: &EncryptionError);
}

impl<F> DecryptionResultHandler for F
where
    F: Fn(&Value, &EncryptionError) + Send + Sync,
{
    fn handle(&self, encrypted_content: &Value, error: &EncryptionError) {
        self(encrypted_content, error)
    }
}

//! Lazily decrypted items.

use std::sync::Arc;

use coffer_encryption::{decrypt_document, DecryptionContext, Encryptor};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ContainerError;

enum State {
    Undecrypted(Value),
    Decrypted {
        value: Value,
        context: Option<DecryptionContext>,
    },
}

/// An item whose decryption is deferred until [`DecryptableItem::get_item`].
///
/// A failure surfaces from `get_item` as
/// [`coffer_encryption::EncryptionError::DecryptionFailed`] and leaves the
/// item undecrypted, so other items of the same page are unaffected.
pub struct DecryptableItem {
    state: State,
    encryptor: Arc<dyn Encryptor>,
}

impl std::fmt::Debug for DecryptableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptableItem")
            .field("decrypted", &self.is_decrypted())
            .finish()
    }
}

impl DecryptableItem {
    pub(crate) fn new(item: Value, encryptor: Arc<dyn Encryptor>) -> Self {
        Self {
            state: State::Undecrypted(item),
            encryptor,
        }
    }

    /// Whether decryption already ran successfully.
    pub fn is_decrypted(&self) -> bool {
        matches!(self.state, State::Decrypted { .. })
    }

    /// The document as stored, or the decrypted document once
    /// [`DecryptableItem::get_item`] succeeded.
    pub fn raw(&self) -> &Value {
        match &self.state {
            State::Undecrypted(value) | State::Decrypted { value, .. } => value,
        }
    }

    /// Decrypts the item on first call and deserializes it. The decryption
    /// context is `None` for documents that carried no encrypted paths.
    pub async fn get_item<T: DeserializeOwned>(
        &mut self,
    ) -> Result<(T, Option<DecryptionContext>), ContainerError> {
        let (value, context) = match &self.state {
            State::Decrypted { value, context } => (value.clone(), context.clone()),
            State::Undecrypted(encrypted) => {
                let (value, context) =
                    decrypt_document(encrypted.clone(), &*self.encryptor).await?;
                self.state = State::Decrypted {
                    value: value.clone(),
                    context: context.clone(),
                };
                (value, context)
            }
        };

        Ok((serde_json::from_value(value)?, context))
    }
}

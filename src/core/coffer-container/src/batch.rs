//! Transactional batches through an encryption container.

use coffer_storage::{BatchOperation, BatchOperationResult, BatchResponse, PartitionKey};
use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use crate::container::{request_options, EncryptionContainer, EncryptionItemRequestOptions};
use crate::error::ContainerError;

enum PendingOperation {
    Create {
        item: Value,
        options: Option<EncryptionItemRequestOptions>,
    },
    Read {
        id: String,
    },
    Replace {
        id: String,
        item: Value,
        options: Option<EncryptionItemRequestOptions>,
    },
    Upsert {
        item: Value,
        options: Option<EncryptionItemRequestOptions>,
    },
    Delete {
        id: String,
        options: Option<EncryptionItemRequestOptions>,
    },
}

/// Ordered operations on one partition, applied all or nothing.
///
/// Payloads are encrypted concurrently when the batch executes, and the
/// documents returned by the store are decrypted the same way.
pub struct EncryptionTransactionalBatch {
    container: EncryptionContainer,
    partition_key: PartitionKey,
    operations: Vec<PendingOperation>,
}

impl EncryptionTransactionalBatch {
    pub(crate) fn new(container: EncryptionContainer, partition_key: PartitionKey) -> Self {
        Self {
            container,
            partition_key,
            operations: Vec::new(),
        }
    }

    /// Adds a create.
    pub fn create_item(mut self, item: Value, options: Option<EncryptionItemRequestOptions>) -> Self {
        self.operations.push(PendingOperation::Create { item, options });
        self
    }

    /// Adds a read.
    pub fn read_item(mut self, id: impl Into<String>) -> Self {
        self.operations.push(PendingOperation::Read { id: id.into() });
        self
    }

    /// Adds a replace.
    pub fn replace_item(
        mut self,
        id: impl Into<String>,
        item: Value,
        options: Option<EncryptionItemRequestOptions>,
    ) -> Self {
        self.operations.push(PendingOperation::Replace {
            id: id.into(),
            item,
            options,
        });
        self
    }

    /// Adds an upsert.
    pub fn upsert_item(mut self, item: Value, options: Option<EncryptionItemRequestOptions>) -> Self {
        self.operations.push(PendingOperation::Upsert { item, options });
        self
    }

    /// Adds a delete.
    pub fn delete_item(
        mut self,
        id: impl Into<String>,
        options: Option<EncryptionItemRequestOptions>,
    ) -> Self {
        self.operations.push(PendingOperation::Delete {
            id: id.into(),
            options,
        });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if no operation is queued.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    async fn prepare(&self, operation: PendingOperation) -> Result<BatchOperation, ContainerError> {
        let container = &self.container;
        let encryption = |options: &Option<EncryptionItemRequestOptions>| {
            options.as_ref().and_then(|o| o.encryption_options.clone())
        };

        Ok(match operation {
            PendingOperation::Create { item, options } => BatchOperation::Create {
                resource: container.encrypt_item(item, encryption(&options).as_ref()).await?,
            },
            PendingOperation::Read { id } => BatchOperation::Read { id },
            PendingOperation::Replace { id, item, options } => BatchOperation::Replace {
                id,
                resource: container.encrypt_item(item, encryption(&options).as_ref()).await?,
                options: request_options(options.as_ref()),
            },
            PendingOperation::Upsert { item, options } => BatchOperation::Upsert {
                resource: container.encrypt_item(item, encryption(&options).as_ref()).await?,
                options: request_options(options.as_ref()),
            },
            PendingOperation::Delete { id, options } => BatchOperation::Delete {
                id,
                options: request_options(options.as_ref()),
            },
        })
    }

    async fn decrypt_result(
        &self,
        result: BatchOperationResult,
    ) -> Result<BatchOperationResult, ContainerError> {
        let resource = match result.resource {
            Some(item) => Some(self.container.decrypt_item(item).await?),
            None => None,
        };
        Ok(BatchOperationResult { resource, ..result })
    }

    /// Encrypts the payloads and executes the batch.
    ///
    /// An encryption failure aborts before anything is sent. A failed
    /// operation is reported in the response, not as an error.
    pub async fn execute(mut self) -> Result<BatchResponse, ContainerError> {
        let pending = std::mem::take(&mut self.operations);
        let count = pending.len();
        let operations = try_join_all(pending.into_iter().map(|op| self.prepare(op))).await?;

        debug!(container = %self.container.id(), operations = count, "Executing encrypted batch");
        let response = self
            .container
            .store()
            .execute_batch(&self.partition_key, operations)
            .await?;

        let BatchResponse {
            status,
            results,
            error_message,
            request_charge,
        } = response;
        let results = try_join_all(results.into_iter().map(|r| self.decrypt_result(r))).await?;

        Ok(BatchResponse {
            status,
            results,
            error_message,
            request_charge,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use crate::container::tests::{clean, doc, options, pk, raw_container, setup};
    use crate::{ContainerError, WithEncryptor};
    use coffer_encryption::EncryptionError;
    use coffer_storage::{DocumentStore, StatusCode, StorageError};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_batch_encrypts_and_decrypts() {
        let (_tmp, backend, encryptor) = setup().await;
        let raw = raw_container(&backend, "data", None).await;
        let container = raw.clone().with_encryptor(encryptor).unwrap();
        container
            .create_item(&doc("0", "old"), Some(&pk()), Some(&options("dek2", &["/Sensitive"])))
            .await
            .unwrap();

        let response = container
            .create_transactional_batch(pk())
            .create_item(doc("1", "one"), Some(options("dek1", &["/Sensitive"])))
            .upsert_item(doc("2", "two"), Some(options("dek2", &["/Sensitive", "/Nested"])))
            .read_item("0")
            .replace_item("0", doc("0", "new"), Some(options("dek1", &["/Sensitive"])))
            .execute()
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.results.len(), 4);
        assert_eq!(response.results[0].status, StatusCode::Created);
        assert_eq!(clean(response.results[0].resource.clone().unwrap()), doc("1", "one"));
        assert_eq!(clean(response.results[1].resource.clone().unwrap()), doc("2", "two"));
        assert_eq!(response.results[2].resource.as_ref().unwrap()["Sensitive"], json!("old"));
        assert_eq!(response.results[3].resource.as_ref().unwrap()["Sensitive"], json!("new"));

        let stored = raw.read_item("2", &pk()).await.unwrap().resource.unwrap();
        assert_ne!(stored["Sensitive"], json!("two"));
        assert!(stored["Nested"].is_string());
    }

    #[tokio::test]
    async fn test_failed_operation_rolls_back() {
        let (_tmp, backend, encryptor) = setup().await;
        let raw = raw_container(&backend, "data", None).await;
        let container = raw.clone().with_encryptor(encryptor).unwrap();
        container.create_item(&doc("1", "one"), Some(&pk()), None).await.unwrap();

        let response = container
            .create_transactional_batch(pk())
            .create_item(doc("2", "two"), Some(options("dek1", &["/Sensitive"])))
            .create_item(doc("1", "dup"), None)
            .execute()
            .await
            .unwrap();

        assert!(!response.is_success());
        assert_eq!(response.status, StatusCode::Conflict);
        assert_eq!(response.results[0].status, StatusCode::FailedDependency);
        assert!(matches!(
            raw.read_item("2", &pk()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_encryption_failure_sends_nothing() {
        let (_tmp, backend, encryptor) = setup().await;
        let raw = raw_container(&backend, "data", None).await;
        let container = raw.clone().with_encryptor(encryptor.clone()).unwrap();

        let batch = container
            .create_transactional_batch(pk())
            .create_item(doc("1", "one"), Some(options("dek1", &["/Sensitive"])))
            .create_item(doc("2", "two"), Some(options("dek1", &["/id"])));
        assert_eq!(batch.len(), 2);

        let result = batch.execute().await;
        assert!(matches!(
            result,
            Err(ContainerError::Encryption(EncryptionError::InvalidPath { .. }))
        ));
        assert!(matches!(
            raw.read_item("1", &pk()).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(encryptor.calls.load(Ordering::SeqCst) <= 1);
    }
}

//! Re-encryption of a container's documents into another container.
//!
//! The iterator walks the source change feed one page at a time. Each
//! document is decrypted with the source settings, encrypted again with the
//! destination's policy or [`ReencryptionOptions::destination_encryption_options`],
//! and upserted into the destination. Deletes in the source are read as
//! change feed tombstones and applied to the destination. Upserts and
//! deletes that tolerate a missing document make replaying a page safe, so
//! a saved continuation token can always be resumed from.

use std::sync::Arc;

use coffer_encryption::{decrypt_document, EncryptionOptions};
use coffer_storage::{
    ChangeFeedDelete, ChangeFeedMode, ChangeFeedStart, ItemRequestOptions, PartitionKey,
    StatusCode, StorageError,
};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::container::EncryptionContainer;
use crate::error::ContainerError;

/// Selects which documents are re-encrypted. Receives the decrypted
/// document.
pub type ReencryptionFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Default page size of the source change feed.
pub const DEFAULT_MAX_ITEM_COUNT: usize = 100;

/// Options of a [`ReencryptionIterator`].
#[derive(Clone)]
pub struct ReencryptionOptions {
    /// Documents rejected by the filter are skipped.
    pub filter: Option<ReencryptionFilter>,
    /// Resume after this token instead of from the beginning.
    pub continuation_token: Option<String>,
    /// Page size.
    pub max_item_count: usize,
    /// Paths to encrypt in the destination. Only for destinations without a
    /// client encryption policy.
    pub destination_encryption_options: Option<EncryptionOptions>,
    /// Allow a destination that encrypts nothing.
    pub allow_plaintext_destination: bool,
}

impl Default for ReencryptionOptions {
    fn default() -> Self {
        Self {
            filter: None,
            continuation_token: None,
            max_item_count: DEFAULT_MAX_ITEM_COUNT,
            destination_encryption_options: None,
            allow_plaintext_destination: false,
        }
    }
}

impl std::fmt::Debug for ReencryptionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReencryptionOptions")
            .field("filter", &self.filter.is_some())
            .field("continuation_token", &self.continuation_token)
            .field("max_item_count", &self.max_item_count)
            .field("destination_encryption_options", &self.destination_encryption_options)
            .field("allow_plaintext_destination", &self.allow_plaintext_destination)
            .finish()
    }
}

impl ReencryptionOptions {
    /// Sets the document filter.
    pub fn with_filter(mut self, filter: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Resumes after `token`.
    pub fn with_continuation_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    /// Sets the page size.
    pub fn with_max_item_count(mut self, max_item_count: usize) -> Self {
        self.max_item_count = max_item_count;
        self
    }

    /// Encrypts destination documents with `options`.
    pub fn with_destination_encryption_options(mut self, options: EncryptionOptions) -> Self {
        self.destination_encryption_options = Some(options);
        self
    }

    /// Writes decrypted documents to a destination that has neither a
    /// policy nor destination encryption options.
    pub fn with_plaintext_destination(mut self) -> Self {
        self.allow_plaintext_destination = true;
        self
    }
}

/// A document that could not be re-encrypted.
#[derive(Debug)]
pub struct ReencryptionFailure {
    /// Document id, empty if the document had none.
    pub id: String,
    /// What went wrong.
    pub error: ContainerError,
}

/// Result of one [`ReencryptionIterator::encrypt_next`] call.
#[derive(Debug)]
pub struct ReencryptionResponse {
    /// `Ok` when the page was fully processed, `NotModified` when the source
    /// had no new changes, `MultiStatus` when some documents failed.
    pub status: StatusCode,
    /// Token to resume from. Unchanged by a page with failures.
    pub continuation_token: Option<String>,
    /// Documents written to the destination.
    pub documents_reencrypted: usize,
    /// Source deletes applied to the destination.
    pub documents_deleted: usize,
    /// Documents that failed.
    pub failures: Vec<ReencryptionFailure>,
}

impl ReencryptionResponse {
    /// Returns true unless some document failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Applied {
    Reencrypted,
    Deleted,
    Skipped,
}

/// Copies documents from a source container into a destination container,
/// re-encrypting them on the way.
pub struct ReencryptionIterator {
    source: EncryptionContainer,
    destination: EncryptionContainer,
    filter: Option<ReencryptionFilter>,
    destination_options: Option<EncryptionOptions>,
    max_item_count: usize,
    position: ChangeFeedStart,
    has_more_results: bool,
}

impl ReencryptionIterator {
    pub(crate) fn new(
        source: EncryptionContainer,
        destination: EncryptionContainer,
        options: ReencryptionOptions,
    ) -> Result<Self, ContainerError> {
        let has_policy = destination.client_encryption_policy().is_some();
        match (has_policy, &options.destination_encryption_options) {
            (true, Some(_)) => {
                return Err(ContainerError::Unsupported(format!(
                    "destination '{}' has a client encryption policy; destination encryption options are not allowed",
                    destination.id()
                )))
            }
            (false, None) if !options.allow_plaintext_destination => {
                return Err(ContainerError::Unsupported(format!(
                    "destination '{}' has no client encryption policy and no destination encryption options; documents would be written in plaintext",
                    destination.id()
                )))
            }
            _ => {}
        }

        let position = match options.continuation_token {
            Some(token) => ChangeFeedStart::Continuation(token),
            None => ChangeFeedStart::Beginning,
        };

        Ok(Self {
            source,
            destination,
            filter: options.filter,
            destination_options: options.destination_encryption_options,
            max_item_count: options.max_item_count,
            position,
            has_more_results: true,
        })
    }

    /// False once the source change feed has caught up. Calling
    /// [`ReencryptionIterator::encrypt_next`] again picks up later writes.
    pub fn has_more_results(&self) -> bool {
        self.has_more_results
    }

    /// Token to resume from, if a page has been completed.
    pub fn continuation_token(&self) -> Option<&str> {
        match &self.position {
            ChangeFeedStart::Continuation(token) => Some(token),
            ChangeFeedStart::Beginning => None,
        }
    }

    async fn apply(&self, change: Value) -> Result<Applied, ContainerError> {
        match ChangeFeedDelete::from_document(&change) {
            Some(delete) => self.delete(delete).await,
            None => self.reencrypt(change).await,
        }
    }

    async fn delete(&self, delete: ChangeFeedDelete) -> Result<Applied, ContainerError> {
        let result = self
            .destination
            .store()
            .delete_item(&delete.id, &delete.partition_key, &ItemRequestOptions::default())
            .await;

        match result {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(Applied::Deleted),
            Err(e) => Err(e.into()),
        }
    }

    async fn reencrypt(&self, document: Value) -> Result<Applied, ContainerError> {
        let (plain, _) = decrypt_document(document, &**self.source.encryptor()).await?;
        if let Some(filter) = &self.filter {
            if !filter(&plain) {
                return Ok(Applied::Skipped);
            }
        }

        let encrypted = self
            .destination
            .encrypt_item(plain, self.destination_options.as_ref())
            .await?;
        let partition_key =
            PartitionKey::from_document(&encrypted, self.destination.partition_key_paths())
                .ok_or(ContainerError::PartitionKeyRequired("encrypt_next"))?;

        self.destination
            .store()
            .upsert_item(encrypted, &partition_key, &ItemRequestOptions::default())
            .await?;
        Ok(Applied::Reencrypted)
    }

    /// Re-encrypts the next page of the source change feed.
    ///
    /// Changes of a page are processed concurrently. If any fails, the
    /// response lists it with status `MultiStatus` and the position is kept,
    /// so the next call replays the same page.
    pub async fn encrypt_next(&mut self) -> Result<ReencryptionResponse, ContainerError> {
        let page = self
            .source
            .store()
            .read_change_feed(&self.position, ChangeFeedMode::WithDeletes, self.max_item_count)
            .await?;

        if page.status == StatusCode::NotModified {
            self.has_more_results = false;
            debug!(source = %self.source.id(), "Re-encryption caught up");
            return Ok(ReencryptionResponse {
                status: StatusCode::NotModified,
                continuation_token: self.continuation_token().map(str::to_string),
                documents_reencrypted: 0,
                documents_deleted: 0,
                failures: Vec::new(),
            });
        }

        let ids: Vec<String> = page
            .items
            .iter()
            .map(|doc| doc.get("id").and_then(Value::as_str).unwrap_or_default().to_string())
            .collect();
        let results = join_all(page.items.into_iter().map(|change| self.apply(change))).await;

        let mut documents_reencrypted = 0;
        let mut documents_deleted = 0;
        let mut failures = Vec::new();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(Applied::Reencrypted) => documents_reencrypted += 1,
                Ok(Applied::Deleted) => documents_deleted += 1,
                Ok(Applied::Skipped) => {}
                Err(error) => {
                    warn!(source = %self.source.id(), id = %id, error = %error, "Re-encryption of document failed");
                    failures.push(ReencryptionFailure { id, error });
                }
            }
        }

        self.has_more_results = true;
        let status = if failures.is_empty() {
            if let Some(token) = page.continuation_token {
                self.position = ChangeFeedStart::Continuation(token);
            }
            StatusCode::Ok
        } else {
            StatusCode::MultiStatus
        };

        info!(
            source = %self.source.id(),
            destination = %self.destination.id(),
            documents_reencrypted,
            documents_deleted,
            failed = failures.len(),
            "Re-encrypted change feed page"
        );

        Ok(ReencryptionResponse {
            status,
            continuation_token: self.continuation_token().map(str::to_string),
            documents_reencrypted,
            documents_deleted,
            failures,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::container::tests::{clean, doc, options, pk, raw_container, setup};
    use crate::WithEncryptor;
    use coffer_crypto::{EncryptionAlgorithm, EncryptionType};
    use coffer_encryption::{ClientEncryptionIncludedPath, ClientEncryptionPolicy};
    use coffer_storage::{DocumentStore, QueryDefinition};
    use serde_json::json;

    async fn drain(iterator: &mut ReencryptionIterator) -> usize {
        let mut total = 0;
        loop {
            let response = iterator.encrypt_next().await.unwrap();
            assert!(response.is_success());
            total += response.documents_reencrypted;
            if response.status == StatusCode::NotModified {
                assert!(!iterator.has_more_results());
                return total;
            }
        }
    }

    async fn all_items(store: &dyn DocumentStore) -> Vec<Value> {
        store
            .query_items(&QueryDefinition::new(), None, 1000)
            .await
            .unwrap()
            .items
    }

    #[tokio::test]
    async fn test_reencrypts_into_new_policy() {
        let (_tmp, backend, encryptor) = setup().await;
        let source = raw_container(&backend, "source", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();
        let policy = ClientEncryptionPolicy::new(vec![ClientEncryptionIncludedPath::new(
            "/Nested",
            "dek2",
            EncryptionType::Randomized,
            EncryptionAlgorithm::AeadAes256GcmHmacSha256,
        )]);
        let raw_destination = raw_container(&backend, "destination", Some(&policy)).await;
        let destination = raw_destination.clone().with_encryptor(encryptor).unwrap();

        let originals: Vec<Value> = (0..10).map(|i| doc(&format!("d{i}"), &format!("s{i}"))).collect();
        for original in &originals {
            source
                .create_item(original, Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
                .await
                .unwrap();
        }

        let mut iterator = source
            .get_reencryption_iterator(
                destination.clone(),
                ReencryptionOptions::default().with_max_item_count(4),
            )
            .unwrap();
        assert_eq!(drain(&mut iterator).await, 10);

        // The old path is plaintext, the new one is encrypted
        let stored = all_items(raw_destination.as_ref()).await;
        assert_eq!(stored.len(), 10);
        for item in &stored {
            assert!(item["Sensitive"].as_str().unwrap().starts_with('s'));
            assert!(item["Nested"].is_string());
            assert_eq!(item["_ei"]["encryptedPaths"]["/Nested"]["dekId"], json!("dek2"));
        }

        let page = destination
            .get_item_query_iterator(QueryDefinition::new(), 100)
            .read_next()
            .await
            .unwrap();
        let decrypted: Vec<Value> = page.items.into_iter().map(clean).collect();
        assert_eq!(decrypted, originals);
    }

    #[tokio::test]
    async fn test_resume_and_replay() {
        let (_tmp, backend, encryptor) = setup().await;
        let source = raw_container(&backend, "source", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();
        let raw_destination = raw_container(&backend, "destination", None).await;
        let destination = raw_destination.clone().with_encryptor(encryptor).unwrap();
        let rotate = EncryptionOptions::new(
            "dek2",
            EncryptionAlgorithm::LegacyAeadAes256Gcm,
            ["/Sensitive"],
        );

        for i in 0..6 {
            source
                .create_item(&doc(&i.to_string(), "s"), Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
                .await
                .unwrap();
        }

        let mut iterator = source
            .get_reencryption_iterator(
                destination.clone(),
                ReencryptionOptions::default()
                    .with_max_item_count(3)
                    .with_destination_encryption_options(rotate.clone()),
            )
            .unwrap();
        let first = iterator.encrypt_next().await.unwrap();
        assert_eq!(first.status, StatusCode::Ok);
        assert_eq!(first.documents_reencrypted, 3);
        let token = first.continuation_token.unwrap();
        assert_eq!(drain(&mut iterator).await, 3);

        // New writes after catching up are picked up by the same iterator
        source
            .create_item(&doc("late", "s"), Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
            .await
            .unwrap();
        assert_eq!(drain(&mut iterator).await, 1);

        // Replaying from an old token rewrites without duplicating
        let mut replay = source
            .get_reencryption_iterator(
                destination.clone(),
                ReencryptionOptions::default()
                    .with_continuation_token(token)
                    .with_destination_encryption_options(rotate),
            )
            .unwrap();
        assert_eq!(drain(&mut replay).await, 4);

        let stored = all_items(raw_destination.as_ref()).await;
        assert_eq!(stored.len(), 7);
        assert!(stored
            .iter()
            .all(|item| item["_ei"]["encryptedPaths"]["/Sensitive"]["dekId"] == json!("dek2")));
    }

    #[tokio::test]
    async fn test_failure_keeps_position() {
        let (_tmp, backend, encryptor) = setup().await;
        let source = raw_container(&backend, "source", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();
        let destination = raw_container(&backend, "destination", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();

        source
            .create_item(&doc("1", "one"), Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
            .await
            .unwrap();
        let mut iterator = source
            .get_reencryption_iterator(
                destination.clone(),
                ReencryptionOptions::default().with_plaintext_destination(),
            )
            .unwrap();
        iterator.encrypt_next().await.unwrap();
        let position = iterator.continuation_token().unwrap().to_string();

        source
            .create_item(&doc("2", "two"), Some(&pk()), Some(&options("dek2", &["/Sensitive"])))
            .await
            .unwrap();
        source
            .create_item(&doc("3", "three"), Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
            .await
            .unwrap();
        encryptor.revoke("dek2");

        let response = iterator.encrypt_next().await.unwrap();
        assert_eq!(response.status, StatusCode::MultiStatus);
        assert_eq!(response.documents_reencrypted, 1);
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].id, "2");
        assert_eq!(response.continuation_token.as_deref(), Some(position.as_str()));
        assert!(iterator.has_more_results());

        // The same page is replayed
        let again = iterator.encrypt_next().await.unwrap();
        assert_eq!(again.status, StatusCode::MultiStatus);
        assert_eq!(iterator.continuation_token(), Some(position.as_str()));
    }

    #[tokio::test]
    async fn test_filter_selects_documents() {
        let (_tmp, backend, encryptor) = setup().await;
        let source = raw_container(&backend, "source", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();
        let raw_destination = raw_container(&backend, "destination", None).await;
        let destination = raw_destination.clone().with_encryptor(encryptor).unwrap();

        for (id, sensitive) in [("1", "keep"), ("2", "drop"), ("3", "keep")] {
            source
                .create_item(&doc(id, sensitive), Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
                .await
                .unwrap();
        }

        let mut iterator = source
            .get_reencryption_iterator(
                destination,
                ReencryptionOptions::default()
                    .with_plaintext_destination()
                    .with_filter(|doc: &Value| doc["Sensitive"] == json!("keep")),
            )
            .unwrap();
        assert_eq!(drain(&mut iterator).await, 2);

        let ids: Vec<Value> = all_items(raw_destination.as_ref())
            .await
            .into_iter()
            .map(|item| item["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("1"), json!("3")]);
    }

    #[tokio::test]
    async fn test_source_deletes_reach_destination() {
        let (_tmp, backend, encryptor) = setup().await;
        let source = raw_container(&backend, "source", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();
        let raw_destination = raw_container(&backend, "destination", None).await;
        let destination = raw_destination.clone().with_encryptor(encryptor).unwrap();
        let rotate = EncryptionOptions::new(
            "dek2",
            EncryptionAlgorithm::LegacyAeadAes256Gcm,
            ["/Sensitive"],
        );

        for i in 1..=3 {
            source
                .create_item(&doc(&i.to_string(), "s"), Some(&pk()), Some(&options("dek1", &["/Sensitive"])))
                .await
                .unwrap();
        }
        let mut iterator = source
            .get_reencryption_iterator(
                destination.clone(),
                ReencryptionOptions::default().with_destination_encryption_options(rotate.clone()),
            )
            .unwrap();
        assert_eq!(drain(&mut iterator).await, 3);
        let token = iterator.continuation_token().unwrap().to_string();

        source.delete_item("1", Some(&pk()), None).await.unwrap();
        let response = iterator.encrypt_next().await.unwrap();
        assert_eq!(response.status, StatusCode::Ok);
        assert_eq!(response.documents_reencrypted, 0);
        assert_eq!(response.documents_deleted, 1);
        assert_eq!(drain(&mut iterator).await, 0);

        let ids: Vec<Value> = all_items(raw_destination.as_ref())
            .await
            .into_iter()
            .map(|item| item["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("2"), json!("3")]);

        // Replaying the delete finds nothing to remove and still succeeds
        let mut replay = source
            .get_reencryption_iterator(
                destination,
                ReencryptionOptions::default()
                    .with_continuation_token(token)
                    .with_destination_encryption_options(rotate),
            )
            .unwrap();
        let response = replay.encrypt_next().await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.documents_deleted, 1);
        assert_eq!(all_items(raw_destination.as_ref()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_plaintext_destination_requires_opt_in() {
        let (_tmp, backend, encryptor) = setup().await;
        let source = raw_container(&backend, "source", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();
        let plain = raw_container(&backend, "plain", None)
            .await
            .with_encryptor(encryptor.clone())
            .unwrap();

        let result = source.get_reencryption_iterator(plain.clone(), ReencryptionOptions::default());
        assert!(matches!(result, Err(ContainerError::Unsupported(_))));
        assert!(source
            .get_reencryption_iterator(plain, ReencryptionOptions::default().with_plaintext_destination())
            .is_ok());

        // A policy destination takes no extra encryption options
        let policy = ClientEncryptionPolicy::new(vec![ClientEncryptionIncludedPath::new(
            "/Nested",
            "dek2",
            EncryptionType::Randomized,
            EncryptionAlgorithm::AeadAes256GcmHmacSha256,
        )]);
        let governed = raw_container(&backend, "governed", Some(&policy))
            .await
            .with_encryptor(encryptor)
            .unwrap();
        let result = source.get_reencryption_iterator(
            governed,
            ReencryptionOptions::default().with_destination_encryption_options(EncryptionOptions::new(
                "dek1",
                EncryptionAlgorithm::LegacyAeadAes256Gcm,
                ["/Sensitive"],
            )),
        );
        assert!(matches!(result, Err(ContainerError::Unsupported(_))));
    }
}

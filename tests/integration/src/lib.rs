//! Integration tests for Coffer.
//!
//! A local key vault is served over HTTP on an ephemeral port and every key
//! operation goes through [`HttpKeyVaultClient`], the same path a remote
//! vault is reached by. Documents live in a temporary SQLite database.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use coffer_container::{EncryptionContainer, WithEncryptor};
use coffer_crypto::{EncryptionAlgorithm, MasterKey};
use coffer_dek::{DataEncryptionKeyProvider, DekCacheConfig};
use coffer_encryption::{ClientEncryptionPolicy, DataEncryptionKeyProviderEncryptor, Encryptor};
use coffer_keyvault::{
    HttpKeyVaultClient, KeyOptions, KeyUri, KeyVaultClient, KeyVaultError, KeyVaultKey,
    KeyWrapAlgorithm, LocalKeyVault, SignResult, UnwrapResult, WrapResult,
};
use coffer_keywrap::{
    EncryptionKeyWrapMetadata, VaultKeyStoreProvider, VaultKeyWrapProvider,
    KEY_VAULT_METADATA_TYPE, KEY_VAULT_PROVIDER_NAME,
};
use coffer_storage::{ContainerProperties, StorageBackend};
use coffer_storage_sqlite::{SqliteBackend, SqliteContainer};

/// Bearer token required by the test vault.
pub const VAULT_TOKEN: &str = "integration-token";

// ============================================================================
// Test Vault
// ============================================================================

/// A local key vault served over HTTP until dropped.
pub struct TestVault {
    pub vault: Arc<LocalKeyVault>,
    pub url: String,
    server: JoinHandle<()>,
}

impl TestVault {
    /// Serves a fresh vault over `storage` on an ephemeral port.
    pub async fn start(storage: Arc<dyn StorageBackend>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind vault listener")?;
        let url = format!("http://{}", listener.local_addr()?);

        let vault = Arc::new(LocalKeyVault::new(storage, MasterKey::generate(), url.clone()));
        let app = coffer_keyvault::server::router(vault.clone(), Some(VAULT_TOKEN.to_string()));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { vault, url, server })
    }

    /// Unversioned URI of a master key.
    pub fn key_uri(&self, name: &str) -> String {
        self.vault.key_uri(name).to_string()
    }
}

impl Drop for TestVault {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// HTTP vault client that counts unwraps.
pub struct CountingVaultClient {
    inner: HttpKeyVaultClient,
    unwraps: AtomicUsize,
}

impl CountingVaultClient {
    pub fn new(inner: HttpKeyVaultClient) -> Self {
        Self {
            inner,
            unwraps: AtomicUsize::new(0),
        }
    }

    pub fn unwraps(&self) -> usize {
        self.unwraps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyVaultClient for CountingVaultClient {
    async fn get_key(&self, uri: &KeyUri) -> Result<KeyVaultKey, KeyVaultError> {
        self.inner.get_key(uri).await
    }

    async fn wrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        key: &[u8],
    ) -> Result<WrapResult, KeyVaultError> {
        self.inner.wrap_key(uri, algorithm, key).await
    }

    async fn unwrap_key(
        &self,
        uri: &KeyUri,
        algorithm: KeyWrapAlgorithm,
        wrapped_key: &[u8],
    ) -> Result<UnwrapResult, KeyVaultError> {
        self.unwraps.fetch_add(1, Ordering::SeqCst);
        self.inner.unwrap_key(uri, algorithm, wrapped_key).await
    }

    async fn sign(&self, uri: &KeyUri, data: &[u8]) -> Result<SignResult, KeyVaultError> {
        self.inner.sign(uri, data).await
    }

    async fn verify(
        &self,
        uri: &KeyUri,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyVaultError> {
        self.inner.verify(uri, data, signature).await
    }
}

// ============================================================================
// Test Environment
// ============================================================================

/// Vault, DEK provider and document database wired together.
pub struct TestEnvironment {
    pub backend: SqliteBackend,
    pub vault: TestVault,
    pub client: Arc<CountingVaultClient>,
    pub provider: Arc<DataEncryptionKeyProvider>,
    pub encryptor: Arc<dyn Encryptor>,
    _data_dir: TempDir,
}

impl TestEnvironment {
    /// Starts an environment with the default cache configuration.
    pub async fn start() -> Result<Self> {
        Self::start_with(DekCacheConfig::default(), false).await
    }

    /// Starts an environment with a custom cache configuration.
    pub async fn start_with(
        cache_config: DekCacheConfig,
        require_deletion_protection: bool,
    ) -> Result<Self> {
        let data_dir = TempDir::new().context("Failed to create temp dir")?;
        let backend = SqliteBackend::open(data_dir.path(), "data").await?;
        let vault_storage = SqliteBackend::open(data_dir.path(), "vault").await?;
        let vault = TestVault::start(Arc::new(vault_storage)).await?;

        let client = Arc::new(CountingVaultClient::new(
            HttpKeyVaultClient::new()?.with_token(VAULT_TOKEN),
        ));
        let provider = DataEncryptionKeyProvider::builder()
            .with_legacy_wrap_provider(Arc::new(VaultKeyWrapProvider::new(client.clone())))
            .with_key_store_provider(Arc::new(
                VaultKeyStoreProvider::new(client.clone())
                    .with_deletion_protection_required(require_deletion_protection),
            ))
            .with_cache_config(cache_config)
            .build()?;

        let keys = backend
            .create_container(ContainerProperties::new("keys", "/id"))
            .await?;
        provider.initialize(Arc::new(keys)).await?;

        let provider = Arc::new(provider);
        let encryptor: Arc<dyn Encryptor> =
            Arc::new(DataEncryptionKeyProviderEncryptor::new(provider.clone()));

        Ok(Self {
            backend,
            vault,
            client,
            provider,
            encryptor,
            _data_dir: data_dir,
        })
    }

    /// Wrap metadata for `key` suited to `algorithm`.
    pub fn key_metadata(&self, key: &str, algorithm: EncryptionAlgorithm) -> EncryptionKeyWrapMetadata {
        let uri = self.vault.key_uri(key);
        match algorithm {
            EncryptionAlgorithm::LegacyAeadAes256Gcm => {
                EncryptionKeyWrapMetadata::new(KEY_VAULT_METADATA_TYPE, uri)
            }
            EncryptionAlgorithm::AeadAes256GcmHmacSha256 => {
                EncryptionKeyWrapMetadata::new(KEY_VAULT_PROVIDER_NAME, uri)
                    .with_algorithm(KeyWrapAlgorithm::A256Gcm.as_str())
            }
        }
    }

    /// Creates a protected master key.
    pub async fn create_master_key(&self, name: &str) -> Result<()> {
        self.vault.vault.create_key(name, KeyOptions::default()).await?;
        Ok(())
    }

    /// Creates a DEK wrapped under master key `key`.
    pub async fn create_dek(&self, id: &str, key: &str, algorithm: EncryptionAlgorithm) -> Result<()> {
        self.provider
            .data_encryption_key_container()
            .create_data_encryption_key(id, algorithm, self.key_metadata(key, algorithm))
            .await?;
        Ok(())
    }

    /// Creates a container partitioned by `/PK` and its encryption view.
    pub async fn container(
        &self,
        id: &str,
        policy: Option<&ClientEncryptionPolicy>,
    ) -> Result<(Arc<SqliteContainer>, EncryptionContainer)> {
        let mut properties = ContainerProperties::new(id, "/PK");
        if let Some(policy) = policy {
            properties = properties.with_client_encryption_policy(policy.to_value()?);
        }
        let raw = Arc::new(self.backend.create_container(properties).await?);
        let container = raw.clone().with_encryptor(self.encryptor.clone())?;
        Ok((raw, container))
    }
}

/// A document mixing strings, numbers, nested objects and arrays.
pub fn customer(id: &str, partition: &str) -> Value {
    json!({
        "id": id,
        "PK": partition,
        "NonSensitive": format!("customer-{id}"),
        "Sensitive": format!("ssn-{id}"),
        "Balance": 1234.5,
        "Visits": 42,
        "Active": true,
        "Address": {
            "Street": "1 Main St",
            "Zip": 98052,
            "Tags": ["home", { "Floor": 3 }, [1, 2]],
        },
    })
}

/// Drops store-managed properties.
pub fn clean(mut value: Value) -> Value {
    coffer_storage::strip_system_properties(&mut value);
    value
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_container::{ContainerError, EncryptionItemRequestOptions, ReencryptionOptions};
    use coffer_crypto::EncryptionType;
    use coffer_dek::DekError;
    use coffer_encryption::{ClientEncryptionIncludedPath, EncryptionError, EncryptionOptions};
    use coffer_keywrap::KeyWrapError;
    use coffer_storage::{
        ChangeFeedStart, DocumentStore, ItemResponse, PartitionKey, QueryDefinition, StatusCode,
        StorageError,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    const LEGACY: EncryptionAlgorithm = EncryptionAlgorithm::LegacyAeadAes256Gcm;
    const KEY_STORE: EncryptionAlgorithm = EncryptionAlgorithm::AeadAes256GcmHmacSha256;

    fn encrypt(dek: &str, paths: &[&str]) -> EncryptionItemRequestOptions {
        EncryptionItemRequestOptions::encrypt(EncryptionOptions::new(dek, LEGACY, paths.iter().copied()))
    }

    fn pk(value: &str) -> PartitionKey {
        PartitionKey::new(value)
    }

    #[tokio::test]
    async fn test_point_stream_and_query_reads() {
        let env = TestEnvironment::start().await.unwrap();
        env.create_master_key("cmk1").await.unwrap();
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        let (raw, container) = env.container("customers", None).await.unwrap();

        let original = customer("1", "p1");
        let options = encrypt("dek1", &["/Sensitive", "/Balance", "/Address"]);
        container
            .create_item(&original, Some(&pk("p1")), Some(&options))
            .await
            .unwrap();

        // Ciphertext at rest
        let stored = raw.read_item("1", &pk("p1")).await.unwrap().resource.unwrap();
        assert_ne!(stored["Sensitive"], original["Sensitive"]);
        assert!(stored["Balance"].is_string());
        assert!(stored["Address"].is_string());
        assert_eq!(stored["NonSensitive"], original["NonSensitive"]);

        let read: ItemResponse<Value> = container.read_item("1", Some(&pk("p1"))).await.unwrap();
        assert_eq!(clean(read.resource.unwrap()), original);

        let stream = container.read_item_stream("1", Some(&pk("p1"))).await.unwrap();
        assert_eq!(stream.status, StatusCode::Ok);
        assert_eq!(clean(stream.content.unwrap()), original);

        let query = QueryDefinition::new().where_eq("/NonSensitive", "customer-1");
        let page = container.get_item_query_iterator(query, 10).read_next().await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(clean(page.items[0].clone()), original);
    }

    #[tokio::test]
    async fn test_partial_failure_is_document_scoped() {
        let env = TestEnvironment::start().await.unwrap();
        env.create_master_key("cmk1").await.unwrap();
        env.create_master_key("cmk2").await.unwrap();
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        env.create_dek("dek2", "cmk2", LEGACY).await.unwrap();
        let (_raw, container) = env.container("customers", None).await.unwrap();

        for (id, dek) in [("1", "dek1"), ("2", "dek2"), ("3", "dek1")] {
            container
                .create_item(&customer(id, "p1"), Some(&pk("p1")), Some(&encrypt(dek, &["/Sensitive"])))
                .await
                .unwrap();
        }

        // dek2 can no longer be unwrapped
        env.vault.vault.set_enabled("cmk2", false).await.unwrap();
        env.provider.cache().remove("dek2");

        let result = container
            .get_item_query_iterator(QueryDefinition::new(), 10)
            .read_next()
            .await;
        match result {
            Err(ContainerError::Encryption(EncryptionError::DecryptionFailed {
                data_encryption_key_id,
                ..
            })) => assert_eq!(data_encryption_key_id, "dek2"),
            other => panic!("unexpected result: {other:?}"),
        }

        let routed = Arc::new(Mutex::new(Vec::new()));
        let sink = routed.clone();
        let handled = container.clone().with_decryption_result_handler(
            move |content: &Value, error: &EncryptionError| {
                sink.lock().unwrap().push((content["id"].clone(), error.to_string()));
            },
        );
        let page = handled
            .get_item_query_iterator(QueryDefinition::new(), 10)
            .read_next()
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(clean(page.items[0].clone()), customer("1", "p1"));
        assert_eq!(clean(page.items[2].clone()), customer("3", "p1"));
        assert!(page.items[1].get("_ei").is_some());

        let routed = routed.lock().unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, json!("2"));
        assert!(routed[0].1.contains("dek2"));

        // Lazy decryption fails only for the affected item
        let mut lazy = container
            .get_item_query_iterator(QueryDefinition::new(), 10)
            .read_next_decryptable()
            .await
            .unwrap();
        assert!(lazy.items[0].get_item::<Value>().await.is_ok());
        match lazy.items[1].get_item::<Value>().await {
            Err(ContainerError::Encryption(EncryptionError::DecryptionFailed {
                data_encryption_key_id,
                encrypted_content,
                ..
            })) => {
                assert_eq!(data_encryption_key_id, "dek2");
                assert_eq!(encrypted_content["id"], json!("2"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(lazy.items[2].get_item::<Value>().await.is_ok());
    }

    #[tokio::test]
    async fn test_reencrypt_into_changed_policy() {
        let env = TestEnvironment::start().await.unwrap();
        env.create_master_key("cmk1").await.unwrap();
        env.create_master_key("cmk2").await.unwrap();
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        env.create_dek("dek2", "cmk2", KEY_STORE).await.unwrap();

        let (_source_raw, source) = env.container("source", None).await.unwrap();
        let policy = ClientEncryptionPolicy::new(vec![
            ClientEncryptionIncludedPath::new("/Balance", "dek2", EncryptionType::Deterministic, KEY_STORE),
            ClientEncryptionIncludedPath::new("/Address", "dek2", EncryptionType::Randomized, KEY_STORE),
        ]);
        let (destination_raw, destination) =
            env.container("destination", Some(&policy)).await.unwrap();

        let originals: Vec<Value> = (0..10).map(|i| customer(&format!("c{i}"), "p1")).collect();
        for original in &originals {
            source
                .create_item(original, Some(&pk("p1")), Some(&encrypt("dek1", &["/Sensitive"])))
                .await
                .unwrap();
        }

        let mut iterator = source.get_reencryption_iterator(
            destination.clone(),
            ReencryptionOptions::default().with_max_item_count(3),
        )
        .unwrap();
        let mut total = 0;
        let mut pages = 0;
        while iterator.has_more_results() {
            let response = iterator.encrypt_next().await.unwrap();
            assert!(response.is_success());
            total += response.documents_reencrypted;
            pages += 1;
        }
        assert_eq!(total, 10);
        assert_eq!(pages, 5);

        // Old path readable, new paths encrypted
        let stored = destination_raw
            .query_items(&QueryDefinition::new(), None, 100)
            .await
            .unwrap()
            .items;
        assert_eq!(stored.len(), 10);
        for item in &stored {
            assert!(item["Sensitive"].as_str().unwrap().starts_with("ssn-"));
            assert!(item["Balance"].is_string());
            assert!(item["Address"].is_string());
        }

        let page = destination
            .get_item_query_iterator(QueryDefinition::new(), 100)
            .read_next()
            .await
            .unwrap();
        let decrypted: Vec<Value> = page.items.into_iter().map(clean).collect();
        assert_eq!(decrypted, originals);

        // Deterministic equality query on the new policy
        let balance = destination
            .encrypt_query_parameter("/Balance", &json!(1234.5))
            .await
            .unwrap();
        let page = destination
            .get_item_query_iterator(QueryDefinition::new().where_eq("/Balance", balance), 100)
            .read_next()
            .await
            .unwrap();
        assert_eq!(page.items.len(), 10);

        // New source writes are picked up on resume
        let token = iterator.continuation_token().unwrap().to_string();
        source
            .create_item(&customer("late", "p1"), Some(&pk("p1")), Some(&encrypt("dek1", &["/Sensitive"])))
            .await
            .unwrap();
        let mut resumed = source
            .get_reencryption_iterator(
                destination.clone(),
                ReencryptionOptions::default().with_continuation_token(token),
            )
            .unwrap();
        let response = resumed.encrypt_next().await.unwrap();
        assert_eq!(response.status, StatusCode::Ok);
        assert_eq!(response.documents_reencrypted, 1);
        let caught_up = resumed.encrypt_next().await.unwrap();
        assert_eq!(caught_up.status, StatusCode::NotModified);

        let late: ItemResponse<Value> = destination.read_item("late", Some(&pk("p1"))).await.unwrap();
        assert_eq!(clean(late.resource.unwrap()), customer("late", "p1"));

        // Source deletes after catching up reach the destination
        source.delete_item("c0", Some(&pk("p1")), None).await.unwrap();
        let response = resumed.encrypt_next().await.unwrap();
        assert_eq!(response.documents_deleted, 1);
        assert_eq!(resumed.encrypt_next().await.unwrap().status, StatusCode::NotModified);
        assert!(matches!(
            destination.read_item::<Value>("c0", Some(&pk("p1"))).await,
            Err(ContainerError::Storage(StorageError::NotFound(_)))
        ));
        assert_eq!(
            destination_raw
                .query_items(&QueryDefinition::new(), None, 100)
                .await
                .unwrap()
                .items
                .len(),
            10
        );
    }

    #[tokio::test]
    async fn test_concurrent_rewraps_and_rotation() {
        let env = TestEnvironment::start().await.unwrap();
        for key in ["cmk1", "cmk2", "cmk3"] {
            env.create_master_key(key).await.unwrap();
        }
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        let (_raw, container) = env.container("customers", None).await.unwrap();
        container
            .create_item(&customer("1", "p1"), Some(&pk("p1")), Some(&encrypt("dek1", &["/Sensitive"])))
            .await
            .unwrap();

        let deks = env.provider.data_encryption_key_container();
        let (a, b) = tokio::join!(
            deks.rewrap_data_encryption_key("dek1", env.key_metadata("cmk2", LEGACY), None),
            deks.rewrap_data_encryption_key("dek1", env.key_metadata("cmk3", LEGACY), None),
        );
        a.unwrap();
        b.unwrap();

        let record = deks.read_data_encryption_key("dek1").await.unwrap().resource.unwrap();
        let value = record.encryption_key_wrap_metadata.value.clone();
        assert!(
            value.starts_with(&env.vault.key_uri("cmk2")) || value.starts_with(&env.vault.key_uri("cmk3")),
            "unexpected master key {value}"
        );

        // The old master key is no longer needed
        env.vault.vault.set_enabled("cmk1", false).await.unwrap();
        env.provider.cache().remove("dek1");
        let read: ItemResponse<Value> = container.read_item("1", Some(&pk("p1"))).await.unwrap();
        assert_eq!(clean(read.resource.unwrap()), customer("1", "p1"));

        // Rotating the current master key keeps old wraps usable
        let current = if value.starts_with(&env.vault.key_uri("cmk2")) { "cmk2" } else { "cmk3" };
        env.vault.vault.rotate_key(current).await.unwrap();
        env.provider.cache().remove("dek1");
        let read: ItemResponse<Value> = container.read_item("1", Some(&pk("p1"))).await.unwrap();
        assert_eq!(clean(read.resource.unwrap()), customer("1", "p1"));

        let rewrapped = deks
            .rewrap_data_encryption_key("dek1", env.key_metadata(current, LEGACY), None)
            .await
            .unwrap()
            .resource
            .unwrap();
        assert!(rewrapped.encryption_key_wrap_metadata.value.ends_with("/2"));
    }

    #[tokio::test]
    async fn test_feed_pagination_across_keys() {
        let env = TestEnvironment::start().await.unwrap();
        env.create_master_key("cmk1").await.unwrap();
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        env.create_dek("dek2", "cmk1", KEY_STORE).await.unwrap();
        let (_raw, container) = env.container("customers", None).await.unwrap();

        for i in 0..25 {
            let options = if i % 2 == 0 {
                encrypt("dek1", &["/Sensitive"])
            } else {
                EncryptionItemRequestOptions::encrypt(
                    EncryptionOptions::new("dek2", KEY_STORE, ["/Sensitive", "/Address"])
                        .with_encryption_type(EncryptionType::Deterministic),
                )
            };
            container
                .create_item(&customer(&format!("{i:02}"), "p1"), Some(&pk("p1")), Some(&options))
                .await
                .unwrap();
        }

        let mut iterator = container.get_item_query_iterator(QueryDefinition::new(), 10);
        let mut sizes = Vec::new();
        let mut seen = 0;
        while iterator.has_more_results() {
            let page = iterator.read_next().await.unwrap();
            sizes.push(page.items.len());
            for item in page.items {
                let id = item["id"].as_str().unwrap().to_string();
                assert_eq!(clean(item), customer(&id, "p1"));
                seen += 1;
            }
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(seen, 25);

        let mut feed = container.get_change_feed_iterator(ChangeFeedStart::Beginning, 10);
        let mut changes = 0;
        loop {
            let page = feed.read_next().await.unwrap();
            if page.status == StatusCode::NotModified {
                break;
            }
            changes += page.items.len();
        }
        assert_eq!(changes, 25);
        assert!(!feed.has_more_results());
    }

    #[tokio::test]
    async fn test_raw_key_cache_ttl_and_vault_outage() {
        let config = DekCacheConfig {
            raw_dek_ttl_override: Some(Duration::from_secs(2)),
            cleanup_interval: Some(Duration::from_millis(50)),
            ..DekCacheConfig::default()
        };
        let env = TestEnvironment::start_with(config, false).await.unwrap();
        env.create_master_key("cmk1").await.unwrap();
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        let (_raw, container) = env.container("customers", None).await.unwrap();
        container
            .create_item(&customer("1", "p1"), Some(&pk("p1")), Some(&encrypt("dek1", &["/Sensitive"])))
            .await
            .unwrap();

        let baseline = env.client.unwraps();
        for _ in 0..3 {
            let _: ItemResponse<Value> = container.read_item("1", Some(&pk("p1"))).await.unwrap();
        }
        assert_eq!(env.client.unwraps(), baseline);
        assert_eq!(env.provider.cache().raw_key_count(), 1);

        // Cached keys keep working while the vault is down
        env.vault.vault.set_online(false);
        let _: ItemResponse<Value> = container.read_item("1", Some(&pk("p1"))).await.unwrap();
        let result = env
            .provider
            .data_encryption_key_container()
            .create_data_encryption_key("dek9", LEGACY, env.key_metadata("cmk1", LEGACY))
            .await;
        assert!(matches!(result, Err(DekError::KeyWrap(KeyWrapError::Access { .. }))));
        env.vault.vault.set_online(true);

        // Expired keys are swept and unwrapped again on next use
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(env.provider.cache().raw_key_count(), 0);
        let _: ItemResponse<Value> = container.read_item("1", Some(&pk("p1"))).await.unwrap();
        assert_eq!(env.client.unwraps(), baseline + 1);
    }

    #[tokio::test]
    async fn test_deletion_protection_enforced() {
        let env = TestEnvironment::start_with(DekCacheConfig::default(), true)
            .await
            .unwrap();
        env.create_master_key("protected").await.unwrap();
        env.vault
            .vault
            .create_key(
                "purgeable",
                KeyOptions {
                    recovery_level: Some("Purgeable".to_string()),
                    ..KeyOptions::default()
                },
            )
            .await
            .unwrap();

        env.create_dek("dek1", "protected", KEY_STORE).await.unwrap();
        let result = env
            .provider
            .data_encryption_key_container()
            .create_data_encryption_key("dek2", KEY_STORE, env.key_metadata("purgeable", KEY_STORE))
            .await;
        assert!(matches!(
            result,
            Err(DekError::KeyWrap(KeyWrapError::DeletionProtectionRequired(_)))
        ));

        // Nothing was persisted for the rejected key
        let read = env
            .provider
            .data_encryption_key_container()
            .read_data_encryption_key("dek2")
            .await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_restricted_paths_rejected_before_vault_calls() {
        let env = TestEnvironment::start().await.unwrap();
        env.create_master_key("cmk1").await.unwrap();
        env.create_dek("dek1", "cmk1", LEGACY).await.unwrap();
        env.provider.cache().remove("dek1");
        let (raw, container) = env.container("customers", None).await.unwrap();

        let before = env.client.unwraps();
        for path in ["/id", "/PK"] {
            let result = container
                .create_item(&customer("1", "p1"), Some(&pk("p1")), Some(&encrypt("dek1", &["/Sensitive", path])))
                .await;
            match result {
                Err(ContainerError::Encryption(EncryptionError::InvalidPath { path: bad, .. })) => {
                    assert_eq!(bad, path)
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(env.client.unwraps(), before);
        assert!(raw.read_item("1", &pk("p1")).await.is_err());
    }
}

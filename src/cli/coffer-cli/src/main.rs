//! Coffer CLI - Command line interface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coffer_container::{
    EncryptionContainer, EncryptionItemRequestOptions, ReencryptionOptions, WithEncryptor,
};
use coffer_crypto::{EncryptionAlgorithm, MasterKey};
use coffer_dek::{DataEncryptionKeyProperties, DataEncryptionKeyProvider};
use coffer_encryption::{ClientEncryptionPolicy, DataEncryptionKeyProviderEncryptor, EncryptionOptions};
use coffer_keyvault::{HttpKeyVaultClient, KeyOptions, KeyUri, KeyVaultClient, LocalKeyVault};
use coffer_keywrap::{
    EncryptionKeyWrapMetadata, KeyWrapAlgorithm, VaultKeyStoreProvider, VaultKeyWrapProvider,
    KEY_VAULT_METADATA_TYPE, KEY_VAULT_PROVIDER_NAME,
};
use coffer_storage::{ContainerProperties, PartitionKey, QueryDefinition, StatusCode};
use coffer_storage_sqlite::SqliteBackend;

/// URL the local vault answers for, and the default bind of `vault serve`.
const LOCAL_VAULT_ADDR: &str = "127.0.0.1:8300";
const DEV_MASTER_KEY_FILE: &str = "master.key";

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "coffer")]
#[command(about = "Coffer - Client-side field-level encryption for document stores")]
#[command(version)]
struct Cli {
    /// Data directory holding the SQLite databases
    #[arg(long, default_value = ".coffer", env = "COFFER_DATA_DIR")]
    data_dir: PathBuf,

    /// Database name
    #[arg(long, default_value = "coffer", env = "COFFER_DATABASE")]
    database: String,

    /// Remote key vault URL; the local vault is used when absent
    #[arg(long, env = "COFFER_VAULT_URL")]
    vault_url: Option<String>,

    /// Bearer token for the remote key vault
    #[arg(long, env = "COFFER_VAULT_TOKEN")]
    vault_token: Option<String>,

    /// Base64 master key of the local vault
    #[arg(long, env = "COFFER_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Container holding data encryption keys
    #[arg(long, default_value = "keys")]
    dek_container: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local key vault management
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
    /// Data encryption key management
    Dek {
        #[command(subcommand)]
        command: DekCommands,
    },
    /// Container management
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
    /// Item operations through the encryption layer
    Item {
        #[command(subcommand)]
        command: ItemCommands,
    },
    /// Re-encrypt a container into another one
    Reencrypt {
        /// Source container
        source: String,
        /// Destination container
        destination: String,
        /// Resume after this continuation token
        #[arg(long)]
        continuation_token: Option<String>,
        /// Page size
        #[arg(long, default_value = "100")]
        max_item_count: usize,
        /// Allow writing decrypted documents to a destination without encryption
        #[arg(long)]
        plaintext: bool,
        #[command(flatten)]
        encryption: EncryptionArgs,
    },
}

#[derive(Subcommand)]
enum VaultCommands {
    /// Create a master key
    CreateKey {
        /// Key name
        name: String,
        /// Mark the key as purgeable (no deletion protection)
        #[arg(long)]
        purgeable: bool,
    },
    /// Add a new version to a master key
    RotateKey {
        /// Key name
        name: String,
    },
    /// List master keys
    ListKeys,
    /// Serve the local vault over HTTP
    Serve {
        /// Bind address
        #[arg(long, default_value = LOCAL_VAULT_ADDR)]
        bind: String,
        /// Require this bearer token
        #[arg(long, env = "COFFER_VAULT_SERVE_TOKEN")]
        token: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    /// AES-256-GCM, wrapped by the vault key wrap provider
    Legacy,
    /// AES-256-GCM with derived subkeys, wrapped through the key store provider
    Keystore,
}

impl From<AlgorithmArg> for EncryptionAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Legacy => EncryptionAlgorithm::LegacyAeadAes256Gcm,
            AlgorithmArg::Keystore => EncryptionAlgorithm::AeadAes256GcmHmacSha256,
        }
    }
}

#[derive(Subcommand)]
enum DekCommands {
    /// Create a data encryption key
    Create {
        /// DEK id
        id: String,
        /// Master key name
        #[arg(long)]
        key: String,
        /// Encryption algorithm
        #[arg(long, value_enum, default_value = "legacy")]
        algorithm: AlgorithmArg,
    },
    /// Show a data encryption key record
    Read {
        /// DEK id
        id: String,
    },
    /// Wrap a data encryption key under another master key
    Rewrap {
        /// DEK id
        id: String,
        /// New master key name
        #[arg(long)]
        key: String,
        /// Switch the algorithm
        #[arg(long, value_enum)]
        algorithm: Option<AlgorithmArg>,
    },
    /// List data encryption keys
    List {
        /// Page size
        #[arg(long, default_value = "100")]
        max_item_count: usize,
    },
}

#[derive(Subcommand)]
enum ContainerCommands {
    /// Create a container
    Create {
        /// Container id
        id: String,
        /// Partition key path
        #[arg(long, default_value = "/pk")]
        partition_key: String,
        /// JSON file holding a client encryption policy
        #[arg(long)]
        policy: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct EncryptionArgs {
    /// DEK encrypting the paths
    #[arg(long)]
    dek: Option<String>,
    /// Path to encrypt (repeatable)
    #[arg(long = "encrypt")]
    paths: Vec<String>,
    /// Encryption algorithm
    #[arg(long, value_enum, default_value = "legacy")]
    algorithm: AlgorithmArg,
}

impl EncryptionArgs {
    fn options(&self) -> Result<Option<EncryptionOptions>> {
        match (&self.dek, self.paths.is_empty()) {
            (None, true) => Ok(None),
            (Some(dek), false) => Ok(Some(EncryptionOptions::new(
                dek.clone(),
                self.algorithm.into(),
                self.paths.iter().cloned(),
            ))),
            (None, false) => bail!("--encrypt requires --dek"),
            (Some(_), true) => bail!("--dek requires at least one --encrypt path"),
        }
    }
}

#[derive(Subcommand)]
enum ItemCommands {
    /// Create or replace a document
    Put {
        /// Container id
        container: String,
        /// Partition key value
        #[arg(long)]
        pk: String,
        /// Document JSON (read from --file when absent)
        data: Option<String>,
        /// File holding the document JSON
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(flatten)]
        encryption: EncryptionArgs,
    },
    /// Read and decrypt a document
    Get {
        /// Container id
        container: String,
        /// Document id
        id: String,
        /// Partition key value
        #[arg(long)]
        pk: String,
    },
}

// ============================================================================
// Environment
// ============================================================================

struct Environment {
    backend: SqliteBackend,
    vault: Arc<dyn KeyVaultClient>,
    local: Option<Arc<LocalKeyVault>>,
    vault_url: String,
    dek_container: String,
}

async fn load_master_key(cli: &Cli) -> Result<MasterKey> {
    if let Some(encoded) = &cli.master_key {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("COFFER_MASTER_KEY is not valid base64")?;
        return MasterKey::from_bytes(&bytes).context("COFFER_MASTER_KEY must be 32 bytes");
    }

    let path = cli.data_dir.join(DEV_MASTER_KEY_FILE);
    tracing::warn!(path = %path.display(), "No master key configured, using a development key - DO NOT USE IN PRODUCTION");

    if tokio::fs::try_exists(&path).await? {
        let encoded = tokio::fs::read_to_string(&path).await?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .with_context(|| format!("Corrupt development key at {}", path.display()))?;
        return MasterKey::from_bytes(&bytes).context("Development key must be 32 bytes");
    }

    let key = MasterKey::generate();
    tokio::fs::write(&path, STANDARD.encode(key.as_bytes()))
        .await
        .with_context(|| format!("Failed to write development key to {}", path.display()))?;
    Ok(key)
}

impl Environment {
    async fn open(cli: &Cli) -> Result<Self> {
        let backend = SqliteBackend::open(&cli.data_dir, &cli.database)
            .await
            .context("Failed to open database")?;

        let vault: Arc<dyn KeyVaultClient>;
        let local;
        let vault_url;
        match &cli.vault_url {
            Some(url) => {
                let mut client = HttpKeyVaultClient::new()?;
                if let Some(token) = &cli.vault_token {
                    client = client.with_token(token);
                }
                vault = Arc::new(client);
                local = None;
                vault_url = url.trim_end_matches('/').to_string();
            }
            None => {
                let master_key = load_master_key(cli).await?;
                vault_url = format!("http://{LOCAL_VAULT_ADDR}");
                let local_vault = Arc::new(LocalKeyVault::new(
                    Arc::new(backend.clone()),
                    master_key,
                    vault_url.clone(),
                ));
                vault = local_vault.clone();
                local = Some(local_vault);
            }
        }

        Ok(Self {
            backend,
            vault,
            local,
            vault_url,
            dek_container: cli.dek_container.clone(),
        })
    }

    fn local_vault(&self) -> Result<&Arc<LocalKeyVault>> {
        self.local
            .as_ref()
            .context("Vault management needs the local vault; unset COFFER_VAULT_URL")
    }

    fn key_metadata(&self, key: &str, algorithm: EncryptionAlgorithm) -> EncryptionKeyWrapMetadata {
        let uri = KeyUri::new(&self.vault_url, key, None).to_string();
        if algorithm == EncryptionAlgorithm::LegacyAeadAes256Gcm {
            EncryptionKeyWrapMetadata::new(KEY_VAULT_METADATA_TYPE, uri)
        } else {
            EncryptionKeyWrapMetadata::new(KEY_VAULT_PROVIDER_NAME, uri)
                .with_algorithm(KeyWrapAlgorithm::A256Gcm.as_str())
        }
    }

    async fn dek_provider(&self) -> Result<Arc<DataEncryptionKeyProvider>> {
        let provider = DataEncryptionKeyProvider::builder()
            .with_legacy_wrap_provider(Arc::new(VaultKeyWrapProvider::new(self.vault.clone())))
            .with_key_store_provider(Arc::new(VaultKeyStoreProvider::new(self.vault.clone())))
            .build()?;

        let keys = self
            .backend
            .create_container_if_not_exists(ContainerProperties::new(&self.dek_container, "/id"))
            .await?;
        provider.initialize(Arc::new(keys)).await?;
        Ok(Arc::new(provider))
    }

    async fn container(&self, id: &str) -> Result<EncryptionContainer> {
        let store = self
            .backend
            .container(id)
            .await
            .with_context(|| format!("Container '{id}' not found"))?;
        let encryptor = Arc::new(DataEncryptionKeyProviderEncryptor::new(self.dek_provider().await?));
        Ok(Arc::new(store).with_encryptor(encryptor)?)
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_dek(properties: &DataEncryptionKeyProperties) {
    println!("DEK '{}':", properties.id);
    println!("  Algorithm:  {}", properties.encryption_algorithm);
    println!("  Master key: {}", properties.encryption_key_wrap_metadata.value);
    if let Some(etag) = &properties.etag {
        println!("  Etag:       {}", etag);
    }
}

// ============================================================================
// Command Handlers
// ============================================================================

async fn cmd_vault(env: &Environment, command: VaultCommands) -> Result<()> {
    let vault = env.local_vault()?;

    match command {
        VaultCommands::CreateKey { name, purgeable } => {
            let mut options = KeyOptions::default();
            if purgeable {
                options.recovery_level = Some("Purgeable".to_string());
            }
            let key = vault.create_key(&name, options).await?;
            println!("Master key created: {}", key.kid);
        }
        VaultCommands::RotateKey { name } => {
            let key = vault.rotate_key(&name).await?;
            println!("Master key rotated: {}", key.kid);
        }
        VaultCommands::ListKeys => {
            let keys = vault.list_keys().await?;
            if keys.is_empty() {
                println!("No master keys found");
            } else {
                println!("Master keys:");
                for key in &keys {
                    println!("  {}", key);
                }
            }
        }
        VaultCommands::Serve { bind, token } => {
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind {bind}"))?;
            tracing::info!(bind = %bind, vault = %vault.vault_url(), "Serving key vault");

            axum::serve(listener, coffer_keyvault::server::router(vault.clone(), token))
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("Shutting down...");
                })
                .await?;
        }
    }

    Ok(())
}

async fn cmd_dek(env: &Environment, command: DekCommands) -> Result<()> {
    let provider = env.dek_provider().await?;
    let deks = provider.data_encryption_key_container();

    match command {
        DekCommands::Create { id, key, algorithm } => {
            let algorithm = algorithm.into();
            let response = deks
                .create_data_encryption_key(&id, algorithm, env.key_metadata(&key, algorithm))
                .await?;
            let properties = response.resource.context("Empty response")?;
            println!("Data encryption key created");
            print_dek(&properties);
        }
        DekCommands::Read { id } => {
            let properties = deks
                .read_data_encryption_key(&id)
                .await?
                .resource
                .context("Empty response")?;
            print_dek(&properties);
        }
        DekCommands::Rewrap { id, key, algorithm } => {
            let current = deks
                .read_data_encryption_key(&id)
                .await?
                .resource
                .context("Empty response")?;
            let target = algorithm.map(EncryptionAlgorithm::from);
            let metadata = env.key_metadata(&key, target.unwrap_or(current.encryption_algorithm));
            let properties = deks
                .rewrap_data_encryption_key(&id, metadata, target)
                .await?
                .resource
                .context("Empty response")?;
            println!("Data encryption key rewrapped");
            print_dek(&properties);
        }
        DekCommands::List { max_item_count } => {
            let mut iterator =
                deks.get_data_encryption_key_query_iterator(QueryDefinition::new(), max_item_count)?;
            let mut count = 0;
            while iterator.has_more_results() {
                for properties in iterator.read_next().await?.items {
                    println!("  {} ({})", properties.id, properties.encryption_algorithm);
                    count += 1;
                }
            }
            if count == 0 {
                println!("No data encryption keys found");
            }
        }
    }

    Ok(())
}

async fn cmd_container(env: &Environment, command: ContainerCommands) -> Result<()> {
    match command {
        ContainerCommands::Create {
            id,
            partition_key,
            policy,
        } => {
            let mut properties = ContainerProperties::new(&id, &partition_key);
            if let Some(path) = policy {
                let policy: ClientEncryptionPolicy = serde_json::from_str(&read_file(&path).await?)
                    .context("Invalid client encryption policy")?;
                policy.validate(&properties.partition_key_paths)?;
                properties = properties.with_client_encryption_policy(policy.to_value()?);
            }
            env.backend.create_container(properties).await?;
            println!("Container '{}' created", id);
        }
    }

    Ok(())
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

async fn cmd_item(env: &Environment, command: ItemCommands) -> Result<()> {
    match command {
        ItemCommands::Put {
            container,
            pk,
            data,
            file,
            encryption,
        } => {
            let raw = match (data, file) {
                (Some(data), _) => data,
                (None, Some(path)) => read_file(&path).await?,
                (None, None) => bail!("Provide the document inline or with --file"),
            };
            let document: Value = serde_json::from_str(&raw).context("Invalid document JSON")?;
            let options = encryption.options()?.map(EncryptionItemRequestOptions::encrypt);

            let container = env.container(&container).await?;
            let response = container
                .upsert_item_stream(document, Some(&PartitionKey::new(pk)), options.as_ref())
                .await?;
            if !response.is_success() {
                bail!(
                    "Write failed ({}): {}",
                    response.status.as_u16(),
                    response.error_message.unwrap_or_default()
                );
            }
            println!("Document written ({})", response.status.as_u16());
        }
        ItemCommands::Get { container, id, pk } => {
            let container = env.container(&container).await?;
            let response = container
                .read_item_stream(&id, Some(&PartitionKey::new(pk)))
                .await?;
            match response.content {
                Some(document) => print_json(&document)?,
                None => bail!(
                    "Read failed ({}): {}",
                    response.status.as_u16(),
                    response.error_message.unwrap_or_default()
                ),
            }
        }
    }

    Ok(())
}

async fn cmd_reencrypt(
    env: &Environment,
    source: &str,
    destination: &str,
    continuation_token: Option<String>,
    max_item_count: usize,
    plaintext: bool,
    encryption: &EncryptionArgs,
) -> Result<()> {
    let source = env.container(source).await?;
    let destination = env.container(destination).await?;

    let mut options = ReencryptionOptions::default().with_max_item_count(max_item_count);
    if let Some(token) = continuation_token {
        options = options.with_continuation_token(token);
    }
    if let Some(encryption) = encryption.options()? {
        options = options.with_destination_encryption_options(encryption);
    }
    if plaintext {
        options = options.with_plaintext_destination();
    }

    let mut iterator = source.get_reencryption_iterator(destination, options)?;
    let mut total = 0;
    let mut deleted = 0;
    loop {
        let response = iterator.encrypt_next().await?;
        total += response.documents_reencrypted;
        deleted += response.documents_deleted;

        if response.status == StatusCode::MultiStatus {
            for failure in &response.failures {
                eprintln!("  {}: {}", failure.id, failure.error);
            }
            bail!(
                "{} document(s) failed; resume with --continuation-token {}",
                response.failures.len(),
                response.continuation_token.unwrap_or_default()
            );
        }
        if !iterator.has_more_results() {
            println!("Re-encrypted {} document(s), deleted {}", total, deleted);
            if let Some(token) = response.continuation_token {
                println!("Continuation token: {}", token);
            }
            return Ok(());
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let env = Environment::open(&cli).await?;

    match cli.command {
        Commands::Vault { command } => cmd_vault(&env, command).await,
        Commands::Dek { command } => cmd_dek(&env, command).await,
        Commands::Container { command } => cmd_container(&env, command).await,
        Commands::Item { command } => cmd_item(&env, command).await,
        Commands::Reencrypt {
            source,
            destination,
            continuation_token,
            max_item_count,
            plaintext,
            encryption,
        } => {
            cmd_reencrypt(
                &env,
                &source,
                &destination,
                continuation_token,
                max_item_count,
                plaintext,
                &encryption,
            )
            .await
        }
    }
}

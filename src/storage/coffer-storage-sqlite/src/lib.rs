//! # Coffer Storage - SQLite Backend
//!
//! SQLite implementation of the storage traits with database isolation.
//! Each database gets its own file and holds a key-value table plus any
//! number of document containers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod container;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use coffer_storage::{ContainerProperties, StorageBackend, StorageError};

pub use container::SqliteContainer;

/// Access granted to a backend handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLevel {
    /// Reads and writes.
    #[default]
    ReadWrite,
    /// Reads only. Writes fail with [`StorageError::Forbidden`].
    ReadOnly,
}

/// SQLite storage backend with database isolation.
///
/// Each database lives in its own file at `{base_path}/{database}.db`.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    database: String,
    access: AccessLevel,
    db_path: PathBuf,
}

impl SqliteBackend {
    /// Opens or creates the SQLite file of a database.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Database name is invalid
    /// - Directory cannot be created
    /// - Database connection fails
    pub async fn open(base_path: impl AsRef<Path>, database: &str) -> Result<Self, StorageError> {
        validate_name("database", database, false)?;

        let base = base_path.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
        })?;

        let db_path = base.join(format!("{database}.db"));
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        debug!(database = %database, path = %db_path.display(), "Opening SQLite database");

        // SQLite has a single writer; one connection keeps write transactions serialized.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let backend = Self {
            pool,
            database: database.to_string(),
            access: AccessLevel::ReadWrite,
            db_path,
        };

        backend.migrate().await?;

        info!(database = %database, "SQLite backend ready");

        Ok(backend)
    }

    /// Returns a handle with the given access level.
    ///
    /// Read-only handles model restricted-token clients: every write fails
    /// with [`StorageError::Forbidden`].
    pub fn with_access(mut self, access: AccessLevel) -> Self {
        self.access = access;
        self
    }

    /// Database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        match self.access {
            AccessLevel::ReadWrite => Ok(()),
            AccessLevel::ReadOnly => Err(StorageError::Forbidden(format!(
                "write access to database '{}' denied",
                self.database
            ))),
        }
    }

    /// Runs database migrations.
    async fn migrate(&self) -> Result<(), StorageError> {
        debug!("Running database migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                version    INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id         TEXT PRIMARY KEY,
                properties TEXT NOT NULL,
                last_lsn   INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                container TEXT NOT NULL,
                pk        TEXT NOT NULL,
                id        TEXT NOT NULL,
                etag      TEXT NOT NULL,
                lsn       INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                body      TEXT NOT NULL,
                PRIMARY KEY (container, pk, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_documents_lsn ON documents (container, lsn)",
            r#"
            CREATE TABLE IF NOT EXISTS tombstones (
                container TEXT NOT NULL,
                pk        TEXT NOT NULL,
                id        TEXT NOT NULL,
                lsn       INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                PRIMARY KEY (container, pk, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tombstones_lsn ON tombstones (container, lsn)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;
        }

        debug!("Migrations complete");

        Ok(())
    }

    /// Creates a container.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a container with the same id exists.
    pub async fn create_container(
        &self,
        properties: ContainerProperties,
    ) -> Result<SqliteContainer, StorageError> {
        self.ensure_writable()?;
        validate_name("container", &properties.id, true)?;

        if properties.partition_key_paths.is_empty()
            || properties
                .partition_key_paths
                .iter()
                .any(|p| !p.starts_with('/') || p.len() < 2)
        {
            return Err(StorageError::InvalidInput(format!(
                "invalid partition key paths for container '{}'",
                properties.id
            )));
        }

        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM containers WHERE id = ?")
            .bind(&properties.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        if existing.is_some() {
            return Err(StorageError::Conflict(format!(
                "container '{}'",
                properties.id
            )));
        }

        let encoded = serde_json::to_string(&properties)?;
        sqlx::query("INSERT INTO containers (id, properties, last_lsn, created_at) VALUES (?, ?, 0, ?)")
            .bind(&properties.id)
            .bind(&encoded)
            .bind(now())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        info!(database = %self.database, container = %properties.id, "Container created");

        Ok(self.container_handle(properties))
    }

    /// Opens the container if it exists, otherwise creates it.
    pub async fn create_container_if_not_exists(
        &self,
        properties: ContainerProperties,
    ) -> Result<SqliteContainer, StorageError> {
        match self.container(&properties.id).await {
            Ok(container) => Ok(container),
            Err(StorageError::NotFound(_)) => self.create_container(properties).await,
            Err(e) => Err(e),
        }
    }

    /// Opens an existing container.
    pub async fn container(&self, id: &str) -> Result<SqliteContainer, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT properties FROM containers WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let (encoded,) = row.ok_or_else(|| StorageError::NotFound(format!("container '{id}'")))?;
        let properties: ContainerProperties = serde_json::from_str(&encoded)?;

        Ok(self.container_handle(properties))
    }

    fn container_handle(&self, properties: ContainerProperties) -> SqliteContainer {
        SqliteContainer::new(
            self.pool.clone(),
            self.database.clone(),
            properties,
            self.access,
        )
    }
}

/// Validates that a database or container name is safe.
///
/// Databases allow `[a-z0-9_-]`, containers additionally allow uppercase.
fn validate_name(kind: &str, name: &str, allow_uppercase: bool) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidInput(format!("{kind} name cannot be empty")));
    }

    if name.len() > 64 {
        return Err(StorageError::InvalidInput(format!("{kind} name too long")));
    }

    let valid = name.chars().all(|c| {
        c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '_'
            || c == '-'
            || (allow_uppercase && c.is_ascii_uppercase())
    });

    if !valid {
        return Err(StorageError::InvalidInput(format!(
            "{kind} name contains invalid characters: {name}"
        )));
    }

    Ok(())
}

/// Returns the current Unix timestamp.
pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let now = now();

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, version, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = kv_store.version + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    async fn insert(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        self.ensure_writable()?;
        let now = now();

        let result = sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, version, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{prefix}%");

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM kv_store WHERE key LIKE ? ORDER BY key")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

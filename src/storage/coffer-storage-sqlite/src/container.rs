//! Document containers stored in SQLite.
//!
//! Documents are kept in one shared table keyed by `(container, pk, id)`.
//! Every write draws the next log sequence number of its container, which
//! doubles as etag source and change feed position.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::debug;

use coffer_storage::{
    strip_system_properties, BatchOperation, BatchOperationResult, BatchResponse,
    ChangeFeedDelete, ChangeFeedMode, ChangeFeedStart, ContainerProperties, DocumentStore,
    FeedResponse, Filter, ItemRequestOptions, ItemResponse, PartitionKey, QueryDefinition,
    SortOrder, StatusCode, StorageError,
};

use crate::{now, AccessLevel};

/// `id, body, etag, ts, lsn`
type DocumentRow = (String, String, String, i64, i64);

/// `id, pk, body, etag, ts, lsn`. Tombstones have no body or etag.
type FeedRow = (String, String, Option<String>, Option<String>, i64, i64);

const READ_CHARGE: f64 = 1.0;
const WRITE_CHARGE: f64 = 5.0;

fn charge(base: f64, body_len: usize) -> f64 {
    base + body_len as f64 / 1024.0
}

fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}

/// Converts a `/a/b` document path into a SQLite JSON path.
fn json_path(path: &str) -> Result<String, StorageError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if !path.starts_with('/') || segments.is_empty() || segments.iter().any(|s| s.contains('"')) {
        return Err(StorageError::InvalidInput(format!("invalid document path: {path}")));
    }

    let mut json = String::from("$");
    for segment in segments {
        json.push_str(".\"");
        json.push_str(segment);
        json.push('"');
    }
    Ok(json)
}

fn document_id(item: &Value) -> Result<String, StorageError> {
    match item.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(StorageError::InvalidInput(
            "document must be an object with a non-empty string id".to_string(),
        )),
    }
}

fn check_etag(options: &ItemRequestOptions, current: &str) -> Result<(), StorageError> {
    match &options.if_match_etag {
        Some(expected) if expected != current => Err(StorageError::PreconditionFailed(format!(
            "etag {expected} does not match {current}"
        ))),
        _ => Ok(()),
    }
}

/// A container inside a [`crate::SqliteBackend`] database.
#[derive(Clone)]
pub struct SqliteContainer {
    pool: SqlitePool,
    database: String,
    properties: ContainerProperties,
    access: AccessLevel,
}

impl SqliteContainer {
    pub(crate) fn new(
        pool: SqlitePool,
        database: String,
        properties: ContainerProperties,
        access: AccessLevel,
    ) -> Self {
        Self {
            pool,
            database,
            properties,
            access,
        }
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        match self.access {
            AccessLevel::ReadWrite => Ok(()),
            AccessLevel::ReadOnly => Err(StorageError::Forbidden(format!(
                "write access to container '{}' denied",
                self.properties.id
            ))),
        }
    }

    fn check_partition_key(&self, item: &Value, pk: &PartitionKey) -> Result<(), StorageError> {
        match PartitionKey::from_document(item, &self.properties.partition_key_paths) {
            Some(actual) if &actual == pk => Ok(()),
            _ => Err(StorageError::InvalidInput(format!(
                "partition key of the document does not match {}",
                pk.to_key_string()
            ))),
        }
    }

    fn to_feed_item(&self, row: FeedRow) -> Result<Value, StorageError> {
        match row {
            (id, _, Some(body), Some(etag), ts, lsn) => self.to_document((id, body, etag, ts, lsn)),
            (id, pk, _, _, ts, lsn) => {
                let mut tombstone = ChangeFeedDelete {
                    id,
                    partition_key: serde_json::from_str(&pk)?,
                }
                .to_document();
                if let Value::Object(map) = &mut tombstone {
                    map.insert("_ts".to_string(), Value::from(ts));
                    map.insert("_lsn".to_string(), Value::from(lsn));
                }
                Ok(tombstone)
            }
        }
    }

    fn to_document(&self, row: DocumentRow) -> Result<Value, StorageError> {
        let (id, body, etag, ts, lsn) = row;
        let mut document: Value = serde_json::from_str(&body)?;
        if let Value::Object(map) = &mut document {
            map.insert("_etag".to_string(), Value::String(etag));
            map.insert("_ts".to_string(), Value::from(ts));
            map.insert("_lsn".to_string(), Value::from(lsn));
            map.insert(
                "_self".to_string(),
                Value::String(format!(
                    "dbs/{}/colls/{}/docs/{}",
                    self.database, self.properties.id, id
                )),
            );
        }
        Ok(document)
    }

    async fn fetch_row(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pk: &PartitionKey,
    ) -> Result<Option<DocumentRow>, StorageError> {
        sqlx::query_as(
            "SELECT id, body, etag, ts, lsn FROM documents WHERE container = ? AND pk = ? AND id = ?",
        )
        .bind(&self.properties.id)
        .bind(pk.to_key_string())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)
    }

    async fn next_lsn(&self, conn: &mut SqliteConnection) -> Result<i64, StorageError> {
        sqlx::query("UPDATE containers SET last_lsn = last_lsn + 1 WHERE id = ?")
            .bind(&self.properties.id)
            .execute(&mut *conn)
            .await
            .map_err(query_err)?;

        let (lsn,): (i64,) = sqlx::query_as("SELECT last_lsn FROM containers WHERE id = ?")
            .bind(&self.properties.id)
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err)?;

        Ok(lsn)
    }

    async fn write_row(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pk: &PartitionKey,
        mut item: Value,
        exists: bool,
    ) -> Result<ItemResponse<Value>, StorageError> {
        strip_system_properties(&mut item);
        let body = serde_json::to_string(&item)?;
        let lsn = self.next_lsn(conn).await?;
        let ts = now();
        let etag = format!("\"{lsn:016x}\"");

        let sql = if exists {
            "UPDATE documents SET etag = ?, lsn = ?, ts = ?, body = ? WHERE container = ? AND pk = ? AND id = ?"
        } else {
            "INSERT INTO documents (etag, lsn, ts, body, container, pk, id) VALUES (?, ?, ?, ?, ?, ?, ?)"
        };

        sqlx::query(sql)
            .bind(&etag)
            .bind(lsn)
            .bind(ts)
            .bind(&body)
            .bind(&self.properties.id)
            .bind(pk.to_key_string())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(query_err)?;

        let request_charge = charge(WRITE_CHARGE, body.len());
        let document = self.to_document((id.to_string(), body, etag.clone(), ts, lsn))?;

        Ok(ItemResponse {
            status: if exists {
                StatusCode::Ok
            } else {
                StatusCode::Created
            },
            resource: Some(document),
            etag: Some(etag),
            request_charge,
        })
    }

    async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        item: Value,
        pk: &PartitionKey,
    ) -> Result<ItemResponse<Value>, StorageError> {
        let id = document_id(&item)?;
        self.check_partition_key(&item, pk)?;

        if self.fetch_row(conn, &id, pk).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "document '{}' in container '{}'",
                id, self.properties.id
            )));
        }

        self.write_row(conn, &id, pk, item, false).await
    }

    async fn read_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pk: &PartitionKey,
    ) -> Result<ItemResponse<Value>, StorageError> {
        let row = self
            .fetch_row(conn, id, pk)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("document '{id}'")))?;

        let request_charge = charge(READ_CHARGE, row.1.len());
        let etag = row.2.clone();

        Ok(ItemResponse {
            status: StatusCode::Ok,
            resource: Some(self.to_document(row)?),
            etag: Some(etag),
            request_charge,
        })
    }

    async fn replace_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        item: Value,
        pk: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError> {
        if document_id(&item)? != id {
            return Err(StorageError::InvalidInput(format!(
                "document id does not match '{id}'"
            )));
        }
        self.check_partition_key(&item, pk)?;

        let row = self
            .fetch_row(conn, id, pk)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("document '{id}'")))?;
        check_etag(options, &row.2)?;

        self.write_row(conn, id, pk, item, true).await
    }

    async fn upsert_in(
        &self,
        conn: &mut SqliteConnection,
        item: Value,
        pk: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError> {
        let id = document_id(&item)?;
        self.check_partition_key(&item, pk)?;

        let exists = match self.fetch_row(conn, &id, pk).await? {
            Some(row) => {
                check_etag(options, &row.2)?;
                true
            }
            None => false,
        };

        self.write_row(conn, &id, pk, item, exists).await
    }

    async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pk: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError> {
        let row = self
            .fetch_row(conn, id, pk)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("document '{id}'")))?;
        check_etag(options, &row.2)?;

        sqlx::query("DELETE FROM documents WHERE container = ? AND pk = ? AND id = ?")
            .bind(&self.properties.id)
            .bind(pk.to_key_string())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(query_err)?;

        let lsn = self.next_lsn(conn).await?;
        sqlx::query(
            r#"
            INSERT INTO tombstones (container, pk, id, lsn, ts) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(container, pk, id) DO UPDATE SET lsn = excluded.lsn, ts = excluded.ts
            "#,
        )
        .bind(&self.properties.id)
        .bind(pk.to_key_string())
        .bind(id)
        .bind(lsn)
        .bind(now())
        .execute(&mut *conn)
        .await
        .map_err(query_err)?;

        Ok(ItemResponse {
            status: StatusCode::NoContent,
            resource: None,
            etag: None,
            request_charge: WRITE_CHARGE,
        })
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        pk: &PartitionKey,
        operation: BatchOperation,
    ) -> Result<ItemResponse<Value>, StorageError> {
        match operation {
            BatchOperation::Create { resource } => self.create_in(conn, resource, pk).await,
            BatchOperation::Read { id } => self.read_in(conn, &id, pk).await,
            BatchOperation::Replace {
                id,
                resource,
                options,
            } => self.replace_in(conn, &id, resource, pk, &options).await,
            BatchOperation::Upsert { resource, options } => {
                self.upsert_in(conn, resource, pk, &options).await
            }
            BatchOperation::Delete { id, options } => {
                self.delete_in(conn, &id, pk, &options).await
            }
        }
    }

    async fn run_write(
        &self,
        pk: &PartitionKey,
        operation: BatchOperation,
    ) -> Result<ItemResponse<Value>, StorageError> {
        self.ensure_writable()?;

        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let response = self.apply(&mut *tx, pk, operation).await?;
        tx.commit().await.map_err(query_err)?;

        Ok(response)
    }
}

#[async_trait]
impl DocumentStore for SqliteContainer {
    fn properties(&self) -> &ContainerProperties {
        &self.properties
    }

    async fn create_item(
        &self,
        item: Value,
        partition_key: &PartitionKey,
    ) -> Result<ItemResponse<Value>, StorageError> {
        self.run_write(partition_key, BatchOperation::Create { resource: item })
            .await
    }

    async fn read_item(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> Result<ItemResponse<Value>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        self.read_in(&mut *conn, id, partition_key).await
    }

    async fn replace_item(
        &self,
        id: &str,
        item: Value,
        partition_key: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError> {
        self.run_write(
            partition_key,
            BatchOperation::Replace {
                id: id.to_string(),
                resource: item,
                options: options.clone(),
            },
        )
        .await
    }

    async fn upsert_item(
        &self,
        item: Value,
        partition_key: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError> {
        self.run_write(
            partition_key,
            BatchOperation::Upsert {
                resource: item,
                options: options.clone(),
            },
        )
        .await
    }

    async fn delete_item(
        &self,
        id: &str,
        partition_key: &PartitionKey,
        options: &ItemRequestOptions,
    ) -> Result<ItemResponse<Value>, StorageError> {
        self.run_write(
            partition_key,
            BatchOperation::Delete {
                id: id.to_string(),
                options: options.clone(),
            },
        )
        .await
    }

    async fn query_items(
        &self,
        query: &QueryDefinition,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<FeedResponse, StorageError> {
        let offset: i64 = match continuation {
            Some(token) => token.parse().map_err(|_| {
                StorageError::InvalidInput(format!("invalid continuation token: {token}"))
            })?,
            None => 0,
        };
        let page_size = max_item_count.max(1) as i64;

        let mut sql =
            String::from("SELECT id, body, etag, ts, lsn FROM documents WHERE container = ?");
        let mut binds = vec![self.properties.id.clone()];

        if let Some(pk) = &query.partition_key {
            sql.push_str(" AND pk = ?");
            binds.push(pk.to_key_string());
        }

        for filter in &query.filters {
            match filter {
                Filter::Equals { path, value } => {
                    sql.push_str(" AND json_extract(body, ?) = json_extract(?, '$')");
                    binds.push(json_path(path)?);
                    binds.push(value.to_string());
                }
                Filter::Range { path, lower, upper } => {
                    if let Some(lower) = lower {
                        sql.push_str(" AND json_extract(body, ?) >= json_extract(?, '$')");
                        binds.push(json_path(path)?);
                        binds.push(lower.to_string());
                    }
                    if let Some(upper) = upper {
                        sql.push_str(" AND json_extract(body, ?) <= json_extract(?, '$')");
                        binds.push(json_path(path)?);
                        binds.push(upper.to_string());
                    }
                }
            }
        }

        match &query.order_by {
            Some((path, order)) => {
                let direction = match order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                sql.push_str(&format!(" ORDER BY json_extract(body, ?) {direction}, id ASC"));
                binds.push(json_path(path)?);
            }
            None => sql.push_str(" ORDER BY pk, id"),
        }
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut statement = sqlx::query_as::<_, DocumentRow>(&sql);
        for bind in &binds {
            statement = statement.bind(bind.as_str());
        }
        let mut rows = statement
            .bind(page_size + 1)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)?;

        let has_more = rows.len() as i64 > page_size;
        rows.truncate(page_size as usize);

        let request_charge = rows
            .iter()
            .fold(READ_CHARGE, |acc, row| acc + row.1.len() as f64 / 1024.0);
        let items = rows
            .into_iter()
            .map(|row| self.to_document(row))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(container = %self.properties.id, count = items.len(), has_more, "Query page");

        Ok(FeedResponse {
            status: StatusCode::Ok,
            continuation_token: has_more.then(|| (offset + items.len() as i64).to_string()),
            items,
            request_charge,
        })
    }

    async fn read_change_feed(
        &self,
        start: &ChangeFeedStart,
        mode: ChangeFeedMode,
        max_item_count: usize,
    ) -> Result<FeedResponse, StorageError> {
        let after: i64 = match start {
            ChangeFeedStart::Beginning => 0,
            ChangeFeedStart::Continuation(token) => token.parse().map_err(|_| {
                StorageError::InvalidInput(format!("invalid continuation token: {token}"))
            })?,
        };

        let with_deletes = mode == ChangeFeedMode::WithDeletes;
        let rows: Vec<FeedRow> = sqlx::query_as(
            r#"
            SELECT id, pk, body, etag, ts, lsn FROM documents WHERE container = ? AND lsn > ?
            UNION ALL
            SELECT id, pk, NULL, NULL, ts, lsn FROM tombstones WHERE container = ? AND lsn > ? AND ?
            ORDER BY lsn LIMIT ?
            "#,
        )
        .bind(&self.properties.id)
        .bind(after)
        .bind(&self.properties.id)
        .bind(after)
        .bind(with_deletes)
        .bind(max_item_count.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let last = rows.last().map(|row| row.5).unwrap_or(after);
        let status = if rows.is_empty() {
            StatusCode::NotModified
        } else {
            StatusCode::Ok
        };

        let items = rows
            .into_iter()
            .map(|row| self.to_feed_item(row))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(container = %self.properties.id, after, ?mode, count = items.len(), "Change feed page");

        Ok(FeedResponse {
            status,
            items,
            continuation_token: Some(last.to_string()),
            request_charge: READ_CHARGE,
        })
    }

    async fn execute_batch(
        &self,
        partition_key: &PartitionKey,
        operations: Vec<BatchOperation>,
    ) -> Result<BatchResponse, StorageError> {
        let writes = operations
            .iter()
            .any(|op| !matches!(op, BatchOperation::Read { .. }));
        if writes {
            self.ensure_writable()?;
        }

        let count = operations.len();
        let mut results = Vec::with_capacity(count);
        let mut request_charge = 0.0;

        let mut tx = self.pool.begin().await.map_err(query_err)?;

        for (index, operation) in operations.into_iter().enumerate() {
            match self.apply(&mut *tx, partition_key, operation).await {
                Ok(response) => {
                    request_charge += response.request_charge;
                    results.push(BatchOperationResult {
                        status: response.status,
                        resource: response.resource,
                        etag: response.etag,
                    });
                }
                Err(err @ (StorageError::QueryFailed(_) | StorageError::ConnectionFailed(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    tx.rollback().await.map_err(query_err)?;

                    let status = err.status_code();
                    debug!(container = %self.properties.id, index, %status, "Batch rolled back");

                    let results = (0..count)
                        .map(|i| BatchOperationResult {
                            status: if i == index {
                                status
                            } else {
                                StatusCode::FailedDependency
                            },
                            resource: None,
                            etag: None,
                        })
                        .collect();

                    return Ok(BatchResponse {
                        status,
                        results,
                        error_message: Some(err.to_string()),
                        request_charge,
                    });
                }
            }
        }

        tx.commit().await.map_err(query_err)?;

        Ok(BatchResponse {
            status: StatusCode::Ok,
            results,
            error_message: None,
            request_charge,
        })
    }
}

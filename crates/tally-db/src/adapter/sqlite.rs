//! # SQLite Engine
//!
//! The indexed document engine.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         <store>.db (WAL)                                │
//! │                                                                         │
//! │  documents    id PK · rev · generation · seq · event_type ·             │
//! │               aggregate_id · at · body · deleted · local_seq UNIQUE     │
//! │               idx (aggregate_id, at) · idx (event_type, at) · idx seq   │
//! │                                                                         │
//! │  revisions    superseded (id, rev, body) rows, purged by compaction     │
//! │                                                                         │
//! │  store_meta   key → JSON value (checkpoints, never replicated)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `local_seq` is the adapter's update sequence: every write moves the row
//! to `MAX(local_seq) + 1`, so the changes feed is a plain range scan.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tally_core::{
    now_millis, Document, Event, Revision, StorageEngine, StorageMetrics, StorageUsage,
};

use super::{
    check_identity, index_aggregate_id, plan_put, plan_replicated, Change, CompactionState,
    IndexField, PersistenceAdapter, WritePlan, WriteResult,
};
use crate::error::{StoreError, StoreResult};
use crate::migrations;

// =============================================================================
// Configuration
// =============================================================================

/// SQLite engine configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = SqliteConfig::new("/var/lib/tally/tally_events.db")
///     .max_connections(4);
/// ```
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file. Created if missing.
    pub database_path: PathBuf,

    /// Default: 5
    pub max_connections: u32,

    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Default: true
    pub run_migrations: bool,

    in_memory: bool,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteConfig {
            database_path: path.into(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
            run_migrations: true,
            in_memory: false,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Private in-memory database (for tests).
    ///
    /// A single connection that is never recycled; closing it would drop
    /// the data.
    pub fn in_memory() -> Self {
        SqliteConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            connect_timeout: Duration::from_secs(5),
            run_migrations: true,
            in_memory: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    rev: String,
    body: String,
    deleted: bool,
    aggregate_id: Option<String>,
    local_seq: i64,
}

impl DocumentRow {
    fn revision(&self) -> StoreResult<Revision> {
        Ok(self.rev.parse()?)
    }

    fn into_document(self) -> StoreResult<Document> {
        let event: Event = serde_json::from_str(&self.body)?;
        let rev: Revision = self.rev.parse()?;
        Ok(Document {
            id: self.id,
            rev: Some(rev),
            deleted: self.deleted,
            aggregate_id: self.aggregate_id,
            event,
        })
    }
}

fn into_documents(rows: Vec<DocumentRow>) -> StoreResult<Vec<Document>> {
    rows.into_iter().map(DocumentRow::into_document).collect()
}

// =============================================================================
// Adapter
// =============================================================================

/// SQLite-backed persistence adapter.
#[derive(Debug)]
pub struct SqliteAdapter {
    name: String,
    pool: SqlitePool,
    /// Serializes read-modify-write transactions.
    write_lock: Mutex<()>,
    compaction: Arc<RwLock<CompactionState>>,
}

impl SqliteAdapter {
    /// Opens (creating if needed) the database and runs migrations.
    ///
    /// ## Returns
    /// * `Err(StoreError::Unavailable)` - the file can't be opened
    /// * `Err(StoreError::MigrationFailed)` - schema could not be applied
    pub async fn open(name: &str, config: SqliteConfig) -> StoreResult<Self> {
        info!(
            store = %name,
            path = %config.database_path.display(),
            "Opening SQLite store"
        );

        let unavailable = |e: sqlx::Error| StoreError::Unavailable(e.to_string());

        let pool = if config.in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(unavailable)?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .acquire_timeout(config.connect_timeout)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .map_err(unavailable)?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(&config.database_path)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(1)
                .acquire_timeout(config.connect_timeout)
                .idle_timeout(Some(Duration::from_secs(600)))
                .connect_with(options)
                .await
                .map_err(unavailable)?
        };

        debug!(store = %name, "SQLite pool created");

        if config.run_migrations {
            migrations::run_migrations(&pool).await?;
        }

        Ok(SqliteAdapter {
            name: name.to_string(),
            pool,
            write_lock: Mutex::new(()),
            compaction: Arc::new(RwLock::new(CompactionState::Idle)),
        })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool. Later calls fail with `Unavailable`.
    pub async fn close(&self) {
        info!(store = %self.name, "Closing SQLite store");
        self.pool.close().await;
    }

    async fn write_docs(&self, docs: Vec<Document>, replicated: bool) -> StoreResult<Vec<WriteResult>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut local_seq = current_local_seq(&mut tx).await?;
        let mut results = Vec::with_capacity(docs.len());

        for doc in docs {
            check_identity(&doc)?;

            let current = fetch_row(&mut tx, &doc.id).await?;
            let current_rev = current.as_ref().map(DocumentRow::revision).transpose()?;
            let tag = Revision::random_tag();

            let plan = if replicated {
                plan_replicated(&doc.id, doc.rev.as_ref(), current_rev.as_ref(), tag)?
            } else {
                plan_put(&doc.id, doc.rev.as_ref(), current_rev.as_ref(), tag)?
            };

            if let WritePlan::Create(rev) | WritePlan::Replace(rev) = &plan {
                if let Some(row) = &current {
                    archive(&mut tx, row).await?;
                }
                local_seq += 1;
                upsert(&mut tx, &doc, rev, local_seq).await?;
            }

            results.push(plan.into_result(&doc.id));
        }

        tx.commit().await?;
        Ok(results)
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

async fn current_local_seq(conn: &mut SqliteConnection) -> StoreResult<i64> {
    let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(local_seq), 0) FROM documents")
        .fetch_one(&mut *conn)
        .await?;
    Ok(seq)
}

async fn fetch_row(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<DocumentRow>> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT id, rev, body, deleted, aggregate_id, local_seq
        FROM documents
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn archive(conn: &mut SqliteConnection, row: &DocumentRow) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO revisions (id, rev, body, superseded_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(row.id.as_str())
    .bind(row.rev.as_str())
    .bind(row.body.as_str())
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert(
    conn: &mut SqliteConnection,
    doc: &Document,
    rev: &Revision,
    local_seq: i64,
) -> StoreResult<()> {
    let body = serde_json::to_string(&doc.event)?;

    sqlx::query(
        r#"
        INSERT INTO documents (
            id, rev, generation, seq, event_type,
            aggregate_id, at, body, deleted, local_seq
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10
        )
        ON CONFLICT(id) DO UPDATE SET
            rev = excluded.rev,
            generation = excluded.generation,
            seq = excluded.seq,
            event_type = excluded.event_type,
            aggregate_id = excluded.aggregate_id,
            at = excluded.at,
            body = excluded.body,
            deleted = excluded.deleted,
            local_seq = excluded.local_seq
        "#,
    )
    .bind(doc.id.as_str())
    .bind(rev.to_string())
    .bind(rev.generation() as i64)
    .bind(doc.event.seq as i64)
    .bind(doc.event.event_type.as_str())
    .bind(index_aggregate_id(doc))
    .bind(doc.event.at)
    .bind(body)
    .bind(doc.deleted)
    .bind(local_seq)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// PersistenceAdapter Implementation
// =============================================================================

#[async_trait]
impl PersistenceAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> StorageEngine {
        StorageEngine::Sqlite
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut conn, id)
            .await?
            .map(DocumentRow::into_document)
            .transpose()
    }

    async fn put(&self, doc: Document) -> StoreResult<WriteResult> {
        let id = doc.id.clone();
        self.write_docs(vec![doc], false)
            .await?
            .pop()
            .ok_or_else(|| StoreError::Internal(format!("no write result for '{}'", id)))
    }

    async fn bulk_put(&self, docs: Vec<Document>) -> StoreResult<Vec<WriteResult>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        self.write_docs(docs, true).await
    }

    async fn remove(&self, id: &str, rev: &Revision) -> StoreResult<WriteResult> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = fetch_row(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let current = row.revision()?;
        if current != *rev {
            return Err(StoreError::conflict(id, Some(rev), Some(&current)));
        }

        archive(&mut tx, &row).await?;
        let local_seq = current_local_seq(&mut tx).await? + 1;

        let mut tombstone = row.into_document()?;
        let next = current.next(Revision::random_tag());
        tombstone.deleted = true;
        tombstone.rev = Some(next.clone());
        upsert(&mut tx, &tombstone, &next, local_seq).await?;

        tx.commit().await?;
        debug!(store = %self.name, id = %id, rev = %next, "Tombstone written");

        Ok(WritePlan::Replace(next).into_result(id))
    }

    async fn list_all(&self) -> StoreResult<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, rev, body, deleted, aggregate_id, local_seq
            FROM documents
            WHERE deleted = 0
            ORDER BY seq ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        into_documents(rows)
    }

    async fn find_by(&self, field: IndexField, value: &str) -> StoreResult<Vec<Document>> {
        let sql = match field {
            IndexField::AggregateId => {
                r#"
                SELECT id, rev, body, deleted, aggregate_id, local_seq
                FROM documents
                WHERE aggregate_id = ?1 AND deleted = 0
                ORDER BY at ASC, seq ASC
                "#
            }
            IndexField::EventType => {
                r#"
                SELECT id, rev, body, deleted, aggregate_id, local_seq
                FROM documents
                WHERE event_type = ?1 AND deleted = 0
                ORDER BY at ASC, seq ASC
                "#
            }
        };

        let rows = sqlx::query_as::<_, DocumentRow>(sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        into_documents(rows)
    }

    async fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Change>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, rev, body, deleted, aggregate_id, local_seq
            FROM documents
            WHERE local_seq > ?1
            ORDER BY local_seq ASC
            LIMIT ?2
            "#,
        )
        .bind(since as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let seq = row.local_seq as u64;
                Ok(Change {
                    seq,
                    doc: row.into_document()?,
                })
            })
            .collect()
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_meta(&self, key: &str, value: Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO store_meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage(&self) -> StoreResult<StorageUsage> {
        let metrics = self.metrics().await?;
        Ok(StorageUsage {
            bytes: metrics.total_size,
            items: metrics.document_count,
        })
    }

    async fn metrics(&self) -> StoreResult<StorageMetrics> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await?;
        let tombstones: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE deleted = 1")
                .fetch_one(&self.pool)
                .await?;
        let superseded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM revisions")
            .fetch_one(&self.pool)
            .await?;
        let update_seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(local_seq), 0) FROM documents")
                .fetch_one(&self.pool)
                .await?;

        let compact_running = self.compaction.read().await.is_running();

        Ok(StorageMetrics::new(
            (page_count.max(0) as u64) * (page_size.max(0) as u64),
            live as u64,
            (tombstones + superseded) as u64,
            update_seq as u64,
            compact_running,
        ))
    }

    async fn compact(&self) -> StoreResult<()> {
        {
            let mut state = self.compaction.write().await;
            if state.is_running() {
                debug!(store = %self.name, "Compaction already running");
                return Ok(());
            }
            *state = CompactionState::Running;
        }

        let pool = self.pool.clone();
        let state = Arc::clone(&self.compaction);
        let name = self.name.clone();

        tokio::spawn(async move {
            let outcome = async {
                let purged = sqlx::query("DELETE FROM revisions").execute(&pool).await?;
                sqlx::query("VACUUM").execute(&pool).await?;
                Ok::<u64, sqlx::Error>(purged.rows_affected())
            }
            .await;

            let next = match outcome {
                Ok(purged) => {
                    info!(store = %name, purged, "SQLite compaction finished");
                    CompactionState::Finished
                }
                Err(e) => {
                    warn!(store = %name, error = %e, "SQLite compaction failed");
                    CompactionState::Failed(e.to_string())
                }
            };
            *state.write().await = next;
        });

        Ok(())
    }

    async fn compaction_state(&self) -> CompactionState {
        self.compaction.read().await.clone()
    }

    async fn destroy(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM revisions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM store_meta").execute(&mut *tx).await?;

        tx.commit().await?;
        *self.compaction.write().await = CompactionState::Idle;

        warn!(store = %self.name, "Store destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{doc, exercise_contract, wait_for_compaction};

    async fn memory_adapter() -> SqliteAdapter {
        SqliteAdapter::open("test_events", SqliteConfig::in_memory())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_contract() {
        let adapter = memory_adapter().await;
        exercise_contract(&adapter).await;
    }

    #[tokio::test]
    async fn test_superseded_revisions_counted_and_compacted() {
        let adapter = memory_adapter().await;

        let first = adapter.put(doc("a", "sale.recorded", Some("s-1"), 10, 1)).await.unwrap();
        let second = adapter
            .put(doc("a", "sale.recorded", Some("s-1"), 10, 1).with_rev(first.rev.clone()))
            .await
            .unwrap();
        assert_eq!(second.rev.generation(), 2);

        let metrics = adapter.metrics().await.unwrap();
        assert_eq!(metrics.document_count, 1);
        assert_eq!(metrics.deleted_count, 1);
        assert!(metrics.total_size > 0);

        let before = adapter.list_all().await.unwrap();
        adapter.compact().await.unwrap();
        assert_eq!(wait_for_compaction(&adapter).await, CompactionState::Finished);

        let metrics = adapter.metrics().await.unwrap();
        assert_eq!(metrics.deleted_count, 0);
        assert!(!metrics.compact_running);
        assert_eq!(adapter.list_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_bulk_put_is_atomic() {
        let adapter = memory_adapter().await;
        adapter.put(doc("a", "sale.recorded", None, 1, 1)).await.unwrap();

        // Second entry has no _rev for an existing id, which fails the batch.
        let batch = vec![
            doc("b", "sale.recorded", None, 2, 2).with_rev("1-x".parse().unwrap()),
            doc("a", "sale.recorded", None, 1, 1),
        ];
        assert!(adapter.bulk_put(batch).await.unwrap_err().is_conflict());
        assert!(adapter.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_events.db");

        {
            let adapter = SqliteAdapter::open("test_events", SqliteConfig::new(&path))
                .await
                .unwrap();
            adapter.put(doc("a", "sale.recorded", Some("s-1"), 1, 1)).await.unwrap();
            adapter
                .put_meta("checkpoint", serde_json::json!({ "seq": 7 }))
                .await
                .unwrap();
            adapter.close().await;
        }

        let adapter = SqliteAdapter::open("test_events", SqliteConfig::new(&path))
            .await
            .unwrap();
        assert!(adapter.get("a").await.unwrap().is_some());
        assert_eq!(
            adapter.get_meta("checkpoint").await.unwrap(),
            Some(serde_json::json!({ "seq": 7 }))
        );

        let (total, applied) = migrations::migration_status(adapter.pool()).await.unwrap();
        assert_eq!(total, applied);
    }
}

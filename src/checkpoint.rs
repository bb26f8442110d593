// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint and assumed-master-state persistence.
//!
//! Stores, per replication identifier:
//! - one opaque [`Checkpoint`] per [`Direction`]
//! - one [`AssumedMasterState`] per document id: the master state the fork
//!   last believed in, used for conflict detection in both directions
//!
//! # Atomic Commits
//!
//! [`CheckpointStore::set_checkpoint()`] writes the meta rows of a batch and
//! the checkpoint that covers them in **one** SQLite transaction. Either both
//! land or neither does, so a persisted checkpoint never points past meta
//! that was not durably written.
//!
//! The pull engine writes fork documents first and commits meta+checkpoint
//! afterwards:
//!
//! ```text
//! pull batch → write docs to fork → commit(meta + checkpoint)
//!                                 (crash here = re-pull batch; fork already
//!                                  equals master, so only meta is written)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement (and every commit transaction as a whole) is
//! retried with exponential backoff before the error is surfaced.

use crate::config::CheckpointConfig;
use crate::document::{Checkpoint, Direction, Document, Revision};
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::QueryBuilder;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Keeps `IN (...)` lookups under SQLite's bound-parameter limit.
const META_LOOKUP_CHUNK: usize = 500;

const IN_MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// The master state a fork believes in for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct AssumedMasterState {
    /// Master's wire state as last seen (pulled, or acknowledged on push).
    pub document: Document,

    /// Set when a conflict resolution wrote this fork revision locally and
    /// it still has to be pushed. The pull engine leaves such documents
    /// alone until the push engine has sent them.
    pub resolved_conflict_rev: Option<Revision>,
}

impl AssumedMasterState {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            resolved_conflict_rev: None,
        }
    }

    pub fn with_resolved_conflict(document: Document, rev: Revision) -> Self {
        Self {
            document,
            resolved_conflict_rev: Some(rev),
        }
    }

    pub fn id(&self) -> &str {
        &self.document.id
    }
}

/// Persistent checkpoint + meta storage backed by SQLite.
///
/// Checkpoints are cached in memory for fast reads; every write goes
/// through a transaction first and updates the cache only after commit.
pub struct CheckpointStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// (replication_id, direction) → checkpoint
    cache: Arc<RwLock<HashMap<(String, Direction), Checkpoint>>>,
    /// Path to database file
    path: String,
    wal_mode: bool,
}

impl CheckpointStore {
    /// Open (or create) a WAL-mode store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::open(&CheckpointConfig {
            sqlite_path: path_str,
            wal_mode: true,
        })
        .await
    }

    /// In-process store that disappears with the pool.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&CheckpointConfig::in_memory()).await
    }

    /// Open a store from config. Creates tables if they don't exist.
    pub async fn open(config: &CheckpointConfig) -> Result<Self> {
        let path_str = config.sqlite_path.clone();
        let in_memory = path_str == IN_MEMORY_PATH;
        let wal_mode = config.wal_mode && !in_memory;
        info!(path = %path_str, wal_mode, "Initializing checkpoint store");

        let pool = if in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // One connection that never recycles: every new connection
            // would otherwise see its own empty database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let journal = if wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2) // Low concurrency needed
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_checkpoints (
                replication_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (replication_id, direction)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_meta (
                replication_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                doc_data TEXT NOT NULL,
                resolved_conflict_rev TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (replication_id, doc_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Load existing checkpoints into cache
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT replication_id, direction, checkpoint FROM replication_checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (replication_id, direction, checkpoint) in rows {
            let direction = match direction.as_str() {
                "up" => Direction::Up,
                "down" => Direction::Down,
                other => {
                    warn!(replication_id = %replication_id, direction = %other, "Ignoring checkpoint with unknown direction");
                    continue;
                }
            };
            let checkpoint: Checkpoint = serde_json::from_str(&checkpoint)?;
            debug!(replication_id = %replication_id, %direction, "Loaded checkpoint from disk");
            cache.insert((replication_id, direction), checkpoint);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
            wal_mode,
        })
    }

    /// Get the checkpoint for one direction of a replication.
    ///
    /// Returns `None` if nothing was replicated yet in that direction.
    pub async fn get_checkpoint(&self, replication_id: &str, direction: Direction) -> Option<Checkpoint> {
        self.cache
            .read()
            .await
            .get(&(replication_id.to_string(), direction))
            .cloned()
    }

    /// Commit meta rows and (optionally) a new checkpoint atomically.
    ///
    /// Pass `checkpoint = None` to write only meta (e.g., a conflict
    /// resolution outside of a batch). Retries the whole transaction on
    /// SQLITE_BUSY/SQLITE_LOCKED.
    pub async fn set_checkpoint(
        &self,
        replication_id: &str,
        direction: Direction,
        checkpoint: Option<&Checkpoint>,
        meta: &[AssumedMasterState],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();

        let meta_rows: Vec<(&str, String, Option<String>)> = meta
            .iter()
            .map(|m| -> Result<(&str, String, Option<String>)> {
                Ok((
                    m.id(),
                    serde_json::to_string(&m.document)?,
                    m.resolved_conflict_rev.as_ref().map(|r| r.to_string()),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let checkpoint_json = checkpoint.map(serde_json::to_string).transpose()?;

        let pool = &self.pool;
        let meta_rows = &meta_rows;
        let checkpoint_json = &checkpoint_json;

        let result = execute_with_retry("commit", || async move {
            let mut tx = pool.begin().await?;

            for (doc_id, doc_data, resolved_rev) in meta_rows {
                sqlx::query(
                    r#"
                    INSERT INTO replication_meta (replication_id, doc_id, doc_data, resolved_conflict_rev, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(replication_id, doc_id) DO UPDATE SET
                        doc_data = excluded.doc_data,
                        resolved_conflict_rev = excluded.resolved_conflict_rev,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(replication_id)
                .bind(*doc_id)
                .bind(doc_data.as_str())
                .bind(resolved_rev.as_deref())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            if let Some(checkpoint_json) = checkpoint_json {
                sqlx::query(
                    r#"
                    INSERT INTO replication_checkpoints (replication_id, direction, checkpoint, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(replication_id, direction) DO UPDATE SET
                        checkpoint = excluded.checkpoint,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(replication_id)
                .bind(direction.as_str())
                .bind(checkpoint_json.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await
        })
        .await;

        let committed_direction = checkpoint.map(|_| direction);
        match result {
            Ok(()) => {
                crate::metrics::record_checkpoint_commit(replication_id, committed_direction, meta.len(), true);
            }
            Err(e) => {
                crate::metrics::record_checkpoint_commit(replication_id, committed_direction, meta.len(), false);
                warn!(replication_id = %replication_id, %direction, error = %e, "Checkpoint commit failed");
                return Err(e.into());
            }
        }

        if let Some(checkpoint) = checkpoint {
            self.cache
                .write()
                .await
                .insert((replication_id.to_string(), direction), checkpoint.clone());
        }

        debug!(
            replication_id = %replication_id,
            %direction,
            meta_rows = meta.len(),
            checkpoint_advanced = checkpoint.is_some(),
            "Checkpoint committed"
        );
        Ok(())
    }

    /// Load assumed master states for the given document ids.
    ///
    /// Ids without meta are absent from the returned map.
    pub async fn assumed_master_states(
        &self,
        replication_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, AssumedMasterState>> {
        let mut found = HashMap::with_capacity(ids.len());
        let pool = &self.pool;

        for chunk in ids.chunks(META_LOOKUP_CHUNK) {
            let rows: Vec<(String, String, Option<String>)> = execute_with_retry("meta_lookup", || async move {
                let mut qb = QueryBuilder::<Sqlite>::new(
                    "SELECT doc_id, doc_data, resolved_conflict_rev FROM replication_meta WHERE replication_id = ",
                );
                qb.push_bind(replication_id);
                qb.push(" AND doc_id IN (");
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind(id.as_str());
                }
                separated.push_unseparated(")");
                qb.build_query_as::<(String, String, Option<String>)>()
                    .fetch_all(pool)
                    .await
            })
            .await?;

            for (doc_id, doc_data, resolved_rev) in rows {
                let document: Document = serde_json::from_str(&doc_data)?;
                let resolved_conflict_rev = resolved_rev
                    .map(|r| r.parse::<Revision>())
                    .transpose()
                    .map_err(|e| ReplicationError::Internal(format!("corrupt meta for {doc_id}: {e}")))?;
                found.insert(
                    doc_id,
                    AssumedMasterState {
                        document,
                        resolved_conflict_rev,
                    },
                );
            }
        }

        Ok(found)
    }

    /// Number of documents with assumed master state (for diagnostics).
    pub async fn meta_count(&self, replication_id: &str) -> Result<u64> {
        let pool = &self.pool;
        let (count,): (i64,) = execute_with_retry("meta_count", || async move {
            sqlx::query_as("SELECT COUNT(*) FROM replication_meta WHERE replication_id = ?")
                .bind(replication_id)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Delete all checkpoints and meta of a replication (e.g., when a
    /// collection is reset and must be replicated from scratch).
    pub async fn delete(&self, replication_id: &str) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("delete", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM replication_meta WHERE replication_id = ?")
                .bind(replication_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM replication_checkpoints WHERE replication_id = ?")
                .bind(replication_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;

        self.cache.write().await.retain(|(id, _), _| id != replication_id);

        info!(replication_id = %replication_id, "Deleted replication state");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("wal_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .field("wal_mode", &self.wal_mode)
            .finish()
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local storage contract.
//!
//! The replication core consumes a document store only through
//! [`ForkStorage`]:
//! - `bulk_write` with optimistic concurrency on the previous revision
//! - `changed_since` returning pages ordered by `(lwt, id)`
//! - `find_by_ids` including tombstones
//! - an optional change stream
//!
//! Storage engines (IndexedDB, SQL, ...) live outside of this crate and
//! implement the trait. [`MemoryStorage`] is a complete in-process
//! implementation used by tests and by storage-to-storage replication
//! through [`StorageMaster`](crate::handler::StorageMaster).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> replication_protocol::Result<()> {
//! use replication_protocol::storage::{ForkStorage, MemoryStorage};
//! use replication_protocol::Document;
//!
//! let fork = MemoryStorage::new("client");
//! fork.upsert(Document::new("todo-1").with_field("title", "write tests")).await?;
//!
//! let page = fork.changed_since(10, None).await?;
//! assert_eq!(page.documents.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::document::{Document, ForkCheckpoint, Revision, StoredDocument};
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// HTTP-style status for a revision mismatch.
pub const STATUS_CONFLICT: u16 = 409;

/// Capacity of the in-memory change broadcast.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Who performed a write.
///
/// Passed explicitly through every write so that consumers of the change
/// stream can tell replication writes from application writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteContext {
    /// Application write.
    Local,
    /// Pull engine applying master state to the fork.
    PullApply,
    /// Conflict resolution written to the fork.
    ConflictResolution,
    /// Push rows accepted by a storage-backed master.
    MasterWrite,
}

impl WriteContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteContext::Local => "local",
            WriteContext::PullApply => "replication-down",
            WriteContext::ConflictResolution => "replication-conflict",
            WriteContext::MasterWrite => "replication-master-write",
        }
    }

    /// Writes that must not trigger a push: they already mirror master.
    pub fn is_pull_echo(&self) -> bool {
        matches!(self, WriteContext::PullApply)
    }
}

/// One row of a bulk write.
#[derive(Debug, Clone)]
pub struct BulkWriteRow {
    pub document: Document,
    /// Revision the writer believes is current; `None` for an insert.
    pub previous: Option<Revision>,
}

/// A row rejected by storage.
#[derive(Debug, Clone)]
pub struct WriteError {
    pub id: String,
    /// 409 for a revision mismatch, anything else is a storage failure.
    pub status: u16,
    /// Current state when the row was rejected.
    pub document_in_db: Option<StoredDocument>,
    pub message: String,
}

impl WriteError {
    pub fn is_conflict(&self) -> bool {
        self.status == STATUS_CONFLICT
    }
}

/// Outcome of a bulk write. Rows succeed or fail individually.
#[derive(Debug, Clone, Default)]
pub struct BulkWriteResult {
    pub success: Vec<StoredDocument>,
    pub errors: Vec<WriteError>,
}

/// One page of [`ForkStorage::changed_since`].
#[derive(Debug, Clone, Default)]
pub struct ChangedDocuments {
    pub documents: Vec<StoredDocument>,
    /// Position of the last document, `None` when the page is empty.
    pub checkpoint: Option<ForkCheckpoint>,
}

/// A committed write, as seen on the change stream.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub documents: Vec<StoredDocument>,
    pub context: WriteContext,
}

/// Trait defining what the replication core needs from a document store.
///
/// Implementations must serialize writes per document id; the engines
/// rely on compare-and-swap on `previous` instead of locking.
pub trait ForkStorage: Send + Sync + 'static {
    /// Write rows, rejecting any row whose `previous` does not match the
    /// stored revision (status 409). Successful rows get a new revision
    /// and a local write time that sorts after every earlier write.
    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: WriteContext) -> BoxFuture<'_, BulkWriteResult>;

    /// Fetch documents by id, tombstones included. Missing ids are absent.
    fn find_by_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashMap<String, StoredDocument>>;

    /// Up to `limit` documents strictly after `checkpoint` in `(lwt, id)` order.
    fn changed_since(&self, limit: usize, checkpoint: Option<ForkCheckpoint>) -> BoxFuture<'_, ChangedDocuments>;

    /// Subscribe to committed writes.
    ///
    /// Default implementation returns `None` (no live capability); the
    /// push side then relies on `re_sync()` or periodic triggers.
    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}

#[derive(Default)]
struct MemoryState {
    docs: HashMap<String, StoredDocument>,
    /// `(lwt, id)` index backing `changed_since`.
    order: BTreeSet<ForkCheckpoint>,
    last_lwt: i64,
}

impl MemoryState {
    /// Strictly increasing, so a rewrite always sorts after every
    /// checkpoint handed out before it, even within one millisecond.
    fn next_lwt(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_lwt = now.max(self.last_lwt + 1);
        self.last_lwt
    }

    fn check_row(&self, row: &BulkWriteRow) -> std::result::Result<(), WriteError> {
        let current = self.docs.get(&row.document.id);
        let matches = match (&row.previous, current) {
            (None, None) => true,
            (Some(previous), Some(current)) => *previous == current.rev,
            _ => false,
        };
        if matches {
            return Ok(());
        }
        Err(WriteError {
            id: row.document.id.clone(),
            status: STATUS_CONFLICT,
            document_in_db: current.cloned(),
            message: format!(
                "revision mismatch: expected {}, found {}",
                row.previous.as_ref().map_or_else(|| "none".to_string(), |r| r.to_string()),
                current.map_or_else(|| "none".to_string(), |c| c.rev.to_string()),
            ),
        })
    }

    fn apply(&mut self, document: Document) -> StoredDocument {
        let lwt = self.next_lwt();
        let previous = self.docs.get(&document.id);
        let rev = Revision::next(previous.map(|p| &p.rev), &document);
        if let Some(previous) = previous {
            let old = previous.position();
            self.order.remove(&old);
        }
        let stored = StoredDocument { doc: document, rev, lwt };
        self.order.insert(stored.position());
        self.docs.insert(stored.doc.id.clone(), stored.clone());
        stored
    }
}

/// In-memory [`ForkStorage`].
///
/// Keeps tombstones forever. Local write times strictly increase, so
/// `changed_since` pages are stable even when the wall clock steps back.
pub struct MemoryStorage {
    name: String,
    state: RwLock<MemoryState>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
            changes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application-level write: overwrites whatever is stored.
    pub async fn upsert(&self, document: Document) -> Result<StoredDocument> {
        if document.id.is_empty() {
            return Err(ReplicationError::storage("upsert", "document id must not be empty"));
        }
        let stored = {
            let mut state = self.state.write().await;
            state.apply(document)
        };
        self.publish(vec![stored.clone()], WriteContext::Local);
        Ok(stored)
    }

    /// Application-level delete: writes a tombstone.
    pub async fn remove(&self, id: &str) -> Result<StoredDocument> {
        self.upsert(Document::tombstone(id)).await
    }

    /// Current state of one document (tombstones included).
    pub async fn get(&self, id: &str) -> Option<StoredDocument> {
        self.state.read().await.docs.get(id).cloned()
    }

    /// All documents in `(lwt, id)` order.
    pub async fn all(&self) -> Vec<StoredDocument> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|pos| state.docs.get(&pos.id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn publish(&self, documents: Vec<StoredDocument>, context: WriteContext) {
        if documents.is_empty() {
            return;
        }
        // No receivers is fine: nobody is live-syncing this store.
        let _ = self.changes.send(ChangeEvent { documents, context });
    }
}

impl ForkStorage for MemoryStorage {
    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: WriteContext) -> BoxFuture<'_, BulkWriteResult> {
        Box::pin(async move {
            let mut result = BulkWriteResult::default();
            {
                let mut state = self.state.write().await;
                for row in rows {
                    if row.document.id.is_empty() {
                        result.errors.push(WriteError {
                            id: String::new(),
                            status: 400,
                            document_in_db: None,
                            message: "document id must not be empty".to_string(),
                        });
                        continue;
                    }
                    match state.check_row(&row) {
                        Ok(()) => result.success.push(state.apply(row.document)),
                        Err(e) => result.errors.push(e),
                    }
                }
            }

            debug!(
                storage = %self.name,
                context = context.as_str(),
                written = result.success.len(),
                rejected = result.errors.len(),
                "Bulk write"
            );
            self.publish(result.success.clone(), context);
            Ok(result)
        })
    }

    fn find_by_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashMap<String, StoredDocument>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(ids
                .into_iter()
                .filter_map(|id| state.docs.get(&id).map(|doc| (id, doc.clone())))
                .collect())
        })
    }

    fn changed_since(&self, limit: usize, checkpoint: Option<ForkCheckpoint>) -> BoxFuture<'_, ChangedDocuments> {
        Box::pin(async move {
            let state = self.state.read().await;
            let lower = match &checkpoint {
                Some(cp) => Bound::Excluded(cp),
                None => Bound::Unbounded,
            };
            let documents: Vec<StoredDocument> = state
                .order
                .range((lower, Bound::Unbounded))
                .take(limit)
                .filter_map(|pos| state.docs.get(&pos.id).cloned())
                .collect();
            let checkpoint = documents.last().map(StoredDocument::position);
            Ok(ChangedDocuments { documents, checkpoint })
        })
    }

    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.changes.subscribe())
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").field("name", &self.name).finish()
    }
}

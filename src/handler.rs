// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side handler contracts.
//!
//! The core never talks to a network itself. Whatever protocol sits in
//! front of the master (HTTP, WebSocket, peer-to-peer) is wrapped in:
//!
//! - [`PullHandler`]: `pull(checkpoint, batch_size) -> {documents, checkpoint}`
//!   plus an optional live [`MasterEvent`] stream
//! - [`PushHandler`]: `push(rows) -> conflicting master states`
//!
//! [`StorageMaster`] implements both on top of any [`ForkStorage`], which
//! turns one local store into the master of another (storage-to-storage
//! replication, and the master used in tests).
//!
//! # Push Acceptance Rule
//!
//! ```text
//! master doc missing                     → write (insert)
//! master doc present, no assumed state   → conflict (return master)
//! is_equal(assumed, master)              → write (CAS on master rev)
//! otherwise                              → conflict (return master)
//! ```

use crate::conflict::ConflictHandler;
use crate::document::{Checkpoint, Document, ForkCheckpoint};
use crate::error::{ReplicationError, Result};
use crate::storage::{BoxFuture, BulkWriteRow, ForkStorage, WriteContext};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// One page returned by a pull handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PullBatch {
    pub documents: Vec<Document>,
    /// Cursor to resume after this page. `None`/null means "unchanged".
    pub checkpoint: Option<Checkpoint>,
}

/// One document sent to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRow {
    pub new_document_state: Document,
    /// What the fork believes master has; `None` on the first push of an id.
    pub assumed_master_state: Option<Document>,
}

/// Event on a master change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterEvent {
    /// Master changed; the documents are informational, the pull engine
    /// always re-reads from its own checkpoint.
    Change(PullBatch),
    /// Master lost track of what was sent (reconnect, overflow).
    /// Forces a full pull from the stored checkpoint.
    Resync,
}

/// Live event stream from master.
pub type MasterStream = BoxStream<'static, MasterEvent>;

/// Fetches master changes.
pub trait PullHandler: Send + Sync + 'static {
    /// Documents strictly after `checkpoint`, in master's stable order,
    /// at most `batch_size` of them.
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> BoxFuture<'_, PullBatch>;

    /// Subscribe to master changes.
    ///
    /// Default implementation returns `None` (no live capability); the
    /// pull side then relies on `re_sync()` or `live_interval`.
    fn stream(&self) -> Option<MasterStream> {
        None
    }
}

/// Sends fork changes to master.
pub trait PushHandler: Send + Sync + 'static {
    /// Apply rows on master. Returns master's real current state for every
    /// row that was rejected because its assumed state was stale.
    fn push(&self, rows: Vec<PushRow>) -> BoxFuture<'_, Vec<Document>>;
}

/// A [`ForkStorage`] acting as master.
pub struct StorageMaster<S: ForkStorage> {
    storage: Arc<S>,
    conflict_handler: Arc<dyn ConflictHandler>,
}

impl<S: ForkStorage> StorageMaster<S> {
    pub fn new(storage: Arc<S>, conflict_handler: Arc<dyn ConflictHandler>) -> Self {
        Self {
            storage,
            conflict_handler,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

impl<S: ForkStorage> PullHandler for StorageMaster<S> {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> BoxFuture<'_, PullBatch> {
        Box::pin(async move {
            let position = match &checkpoint {
                Some(cp) if !cp.is_null() => Some(ForkCheckpoint::from_checkpoint(cp).ok_or_else(|| {
                    ReplicationError::malformed("storage_master", format!("unsupported checkpoint shape: {}", cp.0))
                })?),
                _ => None,
            };

            let page = self.storage.changed_since(batch_size, position).await?;
            let next = page.checkpoint.map(Checkpoint::from).or(checkpoint);
            Ok(PullBatch {
                documents: page.documents.into_iter().map(|d| d.doc).collect(),
                checkpoint: next,
            })
        })
    }

    fn stream(&self) -> Option<MasterStream> {
        let rx = self.storage.change_stream()?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => {
                    let checkpoint = event.documents.iter().map(|d| d.position()).max().map(Checkpoint::from);
                    let batch = PullBatch {
                        documents: event.documents.into_iter().map(|d| d.doc).collect(),
                        checkpoint,
                    };
                    Some((MasterEvent::Change(batch), rx))
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Master change stream lagged, requesting resync");
                    Some((MasterEvent::Resync, rx))
                }
                Err(RecvError::Closed) => None,
            }
        });
        Some(stream.boxed())
    }
}

impl<S: ForkStorage> PushHandler for StorageMaster<S> {
    fn push(&self, rows: Vec<PushRow>) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let ids: Vec<String> = rows.iter().map(|r| r.new_document_state.id.clone()).collect();
            let master_docs = self.storage.find_by_ids(ids).await?;

            let mut conflicts = Vec::new();
            let mut writes = Vec::with_capacity(rows.len());

            for row in rows {
                let id = &row.new_document_state.id;
                match master_docs.get(id) {
                    None => writes.push(BulkWriteRow {
                        document: row.new_document_state,
                        previous: None,
                    }),
                    Some(master) => match &row.assumed_master_state {
                        Some(assumed) if self.conflict_handler.is_equal(assumed, &master.doc) => {
                            writes.push(BulkWriteRow {
                                document: row.new_document_state,
                                previous: Some(master.rev.clone()),
                            });
                        }
                        _ => conflicts.push(master.doc.clone()),
                    },
                }
            }

            if !writes.is_empty() {
                let result = self.storage.bulk_write(writes, WriteContext::MasterWrite).await?;
                for error in result.errors {
                    match (error.is_conflict(), error.document_in_db) {
                        // Lost a race against another writer: report its state
                        (true, Some(current)) => conflicts.push(current.doc),
                        _ => {
                            return Err(ReplicationError::storage(
                                "master_write",
                                format!("{}: {}", error.id, error.message),
                            ))
                        }
                    }
                }
            }

            debug!(conflicts = conflicts.len(), "Master write complete");
            Ok(conflicts)
        })
    }
}

impl<S: ForkStorage> std::fmt::Debug for StorageMaster<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMaster").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::MasterWins;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn master() -> StorageMaster<MemoryStorage> {
        StorageMaster::new(Arc::new(MemoryStorage::new("master")), Arc::new(MasterWins))
    }

    fn row(doc: Document, assumed: Option<Document>) -> PushRow {
        PushRow {
            new_document_state: doc,
            assumed_master_state: assumed,
        }
    }

    #[tokio::test]
    async fn test_push_inserts_new_documents() {
        let master = master();
        let conflicts = master
            .push(vec![row(Document::new("a").with_field("v", 1), None)])
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(master.storage().get("a").await.unwrap().doc.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_push_without_assumed_state_conflicts() {
        let master = master();
        master.storage().upsert(Document::new("a").with_field("v", 1)).await.unwrap();

        let conflicts = master
            .push(vec![row(Document::new("a").with_field("v", 2), None)])
            .await
            .unwrap();
        assert_eq!(conflicts, vec![Document::new("a").with_field("v", 1)]);
        // Master untouched
        assert_eq!(master.storage().get("a").await.unwrap().doc.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_push_with_matching_assumed_state_writes() {
        let master = master();
        let v1 = Document::new("a").with_field("v", 1);
        master.storage().upsert(v1.clone()).await.unwrap();

        let conflicts = master
            .push(vec![row(Document::new("a").with_field("v", 2), Some(v1))])
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        let stored = master.storage().get("a").await.unwrap();
        assert_eq!(stored.doc.get("v"), Some(&json!(2)));
        assert_eq!(stored.rev.height, 2);
    }

    #[tokio::test]
    async fn test_push_with_stale_assumed_state_conflicts() {
        let master = master();
        master.storage().upsert(Document::new("a").with_field("v", 3)).await.unwrap();

        let conflicts = master
            .push(vec![row(
                Document::new("a").with_field("v", 2),
                Some(Document::new("a").with_field("v", 1)),
            )])
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].get("v"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_pull_pages_and_echoes_checkpoint_when_empty() {
        let master = master();
        for i in 0..3 {
            master.storage().upsert(Document::new(format!("d{i}"))).await.unwrap();
        }

        let first = master.pull(None, 2).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        let second = master.pull(first.checkpoint.clone(), 2).await.unwrap();
        assert_eq!(second.documents.len(), 1);
        let third = master.pull(second.checkpoint.clone(), 2).await.unwrap();
        assert!(third.documents.is_empty());
        assert_eq!(third.checkpoint, second.checkpoint);
    }

    #[tokio::test]
    async fn test_pull_rejects_foreign_checkpoint() {
        let master = master();
        let err = master
            .pull(Some(Checkpoint::new(json!({"sequence": 4}))), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_stream_maps_storage_changes() {
        let master = master();
        let mut stream = master.stream().unwrap();

        master.storage().upsert(Document::new("a")).await.unwrap();

        match stream.next().await.unwrap() {
            MasterEvent::Change(batch) => {
                assert_eq!(batch.documents, vec![Document::new("a")]);
                assert!(batch.checkpoint.is_some());
            }
            MasterEvent::Resync => panic!("expected a change event"),
        }
    }
}

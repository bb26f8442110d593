// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push engine: fork → master.
//!
//! Each cycle reads the fork's change feed from the up checkpoint and runs
//! it to exhaustion, one batch at a time:
//!
//! ```text
//! changed_since(up_checkpoint) ──▶ skip docs already mirrored on master
//!            │                                   │
//!            │ empty page → done                 ▼
//!            │                        PushHandler::push(rows)
//!            │                                   │
//!            │                   ┌───────────────┴──────────────┐
//!            │                   ▼                              ▼
//!            │             acknowledged                     conflicts
//!            │          meta = pushed state         ConflictHandler::resolve
//!            │                   │                  write resolution to fork
//!            │                   └───────────────┬──────────────┘
//!            │                                   ▼
//!            └───────────── commit meta + up checkpoint (one transaction)
//! ```
//!
//! # Skip Rule
//!
//! A fork document whose assumed master state equals it arrived via pull
//! (or was already pushed) and is not sent again, unless it is the
//! pending output of a conflict resolution (`resolved_conflict_rev`).
//!
//! # Failure Semantics
//!
//! Handler, conflict-handler and storage errors abort the batch without
//! advancing the checkpoint; the driver retries the whole cycle after
//! backoff. Conflicts are not errors.

use crate::checkpoint::{AssumedMasterState, CheckpointStore};
use crate::conflict::{resolve_for, ConflictHandler, ConflictInput, ConflictOutcome, ResolvedConflict};
use crate::coordinator::{CycleReport, ReplicationEvents};
use crate::document::{Checkpoint, Direction, Document, ForkCheckpoint, StoredDocument};
use crate::error::{ReplicationError, Result};
use crate::handler::{PushHandler, PushRow};
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::storage::{BulkWriteRow, ForkStorage, WriteContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Fork → master replication for one replication identifier.
pub struct PushEngine {
    replication_id: String,
    fork: Arc<dyn ForkStorage>,
    handler: Arc<dyn PushHandler>,
    conflict_handler: Arc<dyn ConflictHandler>,
    store: Arc<CheckpointStore>,
    events: ReplicationEvents,
    batch_size: usize,
    rate_limiter: Option<Arc<RateLimiter>>,
    canceled: watch::Receiver<bool>,
}

/// A fork document selected for pushing.
struct Candidate {
    stored: StoredDocument,
    assumed: Option<Document>,
}

/// A conflict resolution waiting for its fork write.
struct PendingResolution {
    real_master: Document,
    resolved: Document,
}

impl PushEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replication_id: impl Into<String>,
        fork: Arc<dyn ForkStorage>,
        handler: Arc<dyn PushHandler>,
        conflict_handler: Arc<dyn ConflictHandler>,
        store: Arc<CheckpointStore>,
        events: ReplicationEvents,
        batch_size: usize,
        canceled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            replication_id: replication_id.into(),
            fork,
            handler,
            conflict_handler,
            store,
            events,
            batch_size: batch_size.max(1),
            rate_limiter: None,
            canceled,
        }
    }

    /// Throttle push handler calls.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    /// Push every fork change after the up checkpoint.
    ///
    /// Returns once `changed_since` yields an empty page (the fork is fully
    /// pushed) or the replication was canceled between batches.
    pub async fn push_once(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        loop {
            if self.is_canceled() {
                debug!(replication_id = %self.replication_id, "Push cycle stopped by cancel");
                report.canceled = true;
                break;
            }

            let position = self.up_position().await;
            let page = self.fork.changed_since(self.batch_size, position).await?;
            let next = match page.checkpoint {
                Some(next) if !page.documents.is_empty() => next,
                _ => break,
            };

            self.push_batch(page.documents, next, &mut report).await?;
            report.batches += 1;
        }

        metrics::record_cycle(&self.replication_id, Direction::Up, report.batches, started.elapsed());
        Ok(report)
    }

    /// Current up checkpoint as a fork position.
    async fn up_position(&self) -> Option<ForkCheckpoint> {
        let checkpoint = self.store.get_checkpoint(&self.replication_id, Direction::Up).await?;
        let position = ForkCheckpoint::from_checkpoint(&checkpoint);
        if position.is_none() {
            // Only reachable if the fork storage changed its checkpoint shape.
            warn!(
                replication_id = %self.replication_id,
                checkpoint = %checkpoint.0,
                "Unreadable up checkpoint, pushing from the start"
            );
        }
        position
    }

    #[instrument(skip(self, documents, report), fields(replication_id = %self.replication_id, batch = documents.len()))]
    async fn push_batch(
        &self,
        documents: Vec<StoredDocument>,
        next: ForkCheckpoint,
        report: &mut CycleReport,
    ) -> Result<()> {
        let ids: Vec<String> = documents.iter().map(|d| d.id().to_string()).collect();
        let assumed = self.store.assumed_master_states(&self.replication_id, &ids).await?;

        let mut candidates = Vec::with_capacity(documents.len());
        let mut skipped = 0;
        for stored in documents {
            let meta = assumed.get(stored.id());
            if let Some(meta) = meta {
                let pending_resolution = meta.resolved_conflict_rev.as_ref() == Some(&stored.rev);
                if !pending_resolution && self.conflict_handler.is_equal(&meta.document, &stored.doc) {
                    skipped += 1;
                    continue;
                }
            }
            candidates.push(Candidate {
                assumed: meta.map(|m| m.document.clone()),
                stored,
            });
        }
        report.skipped += skipped;
        metrics::record_documents_skipped(&self.replication_id, Direction::Up, "in_sync", skipped);

        let checkpoint = Checkpoint::from(next);
        if candidates.is_empty() {
            // Nothing to send, still move past the echoes.
            return self
                .store
                .set_checkpoint(&self.replication_id, Direction::Up, Some(&checkpoint), &[])
                .await;
        }

        let mut conflicts = self.call_handler(&candidates).await?;

        let mut meta = Vec::with_capacity(candidates.len());
        let mut sent = Vec::new();
        let mut resolutions = Vec::new();
        let mut fork_revs = HashMap::new();

        for candidate in candidates {
            let Candidate { stored, assumed } = candidate;
            let Some(real_master) = conflicts.remove(stored.id()) else {
                meta.push(AssumedMasterState::new(stored.doc.clone()));
                sent.push(stored.doc);
                continue;
            };

            report.conflicts += 1;
            let input = ConflictInput {
                new_document_state: stored.doc.clone(),
                assumed_master_state: assumed,
                real_master_state: real_master,
            };
            let outcome = resolve_for(self.conflict_handler.as_ref(), &input, Direction::Up).await?;

            match &outcome {
                ConflictOutcome::Equal => {
                    metrics::record_conflict(&self.replication_id, Direction::Up, "equal");
                    meta.push(AssumedMasterState::new(input.real_master_state.clone()));
                }
                ConflictOutcome::Resolved(doc) => {
                    metrics::record_conflict(&self.replication_id, Direction::Up, "resolved");
                    fork_revs.insert(stored.id().to_string(), stored.rev.clone());
                    resolutions.push(PendingResolution {
                        real_master: input.real_master_state.clone(),
                        resolved: doc.clone(),
                    });
                }
            }

            self.events.emit_resolved(ResolvedConflict {
                direction: Direction::Up,
                input,
                outcome,
            });
        }

        if !conflicts.is_empty() {
            let unknown: Vec<&String> = conflicts.keys().collect();
            return Err(ReplicationError::malformed(
                "push_handler",
                format!("conflicts returned for documents that were not pushed: {unknown:?}"),
            ));
        }

        meta.extend(self.write_resolutions(resolutions, &fork_revs).await?);

        self.store
            .set_checkpoint(&self.replication_id, Direction::Up, Some(&checkpoint), &meta)
            .await?;

        report.documents += sent.len();
        metrics::record_documents_pushed(&self.replication_id, sent.len());
        debug!(sent = sent.len(), skipped, "Push batch committed");
        for doc in sent {
            self.events.emit_sent(doc);
        }
        Ok(())
    }

    /// Call the push handler and index its conflicts by id.
    async fn call_handler(&self, candidates: &[Candidate]) -> Result<HashMap<String, Document>> {
        let rows: Vec<PushRow> = candidates
            .iter()
            .map(|c| PushRow {
                new_document_state: c.stored.doc.clone(),
                assumed_master_state: c.assumed.clone(),
            })
            .collect();

        if let Some(ref limiter) = self.rate_limiter {
            limiter.acquire().await;
        }

        let call_start = Instant::now();
        let result = self.handler.push(rows).await;
        metrics::record_handler_call(&self.replication_id, Direction::Up, call_start.elapsed(), result.is_ok());

        let mut conflicts = HashMap::new();
        for doc in result? {
            if doc.id.is_empty() {
                return Err(ReplicationError::malformed("push_handler", "conflict document without id"));
            }
            conflicts.insert(doc.id.clone(), doc);
        }
        Ok(conflicts)
    }

    /// Write resolved states to the fork and build their meta rows.
    ///
    /// A resolution that differs from master records its fork revision as
    /// `resolved_conflict_rev`, so the next batch pushes it even though the
    /// pull side will not touch it.
    async fn write_resolutions(
        &self,
        resolutions: Vec<PendingResolution>,
        fork_revs: &HashMap<String, crate::document::Revision>,
    ) -> Result<Vec<AssumedMasterState>> {
        if resolutions.is_empty() {
            return Ok(Vec::new());
        }

        let rows = resolutions
            .iter()
            .map(|r| BulkWriteRow {
                document: r.resolved.clone(),
                previous: fork_revs.get(&r.resolved.id).cloned(),
            })
            .collect();
        let result = self.fork.bulk_write(rows, WriteContext::ConflictResolution).await?;

        for error in &result.errors {
            if !error.is_conflict() {
                return Err(ReplicationError::storage(
                    "write_resolution",
                    format!("{}: {}", error.id, error.message),
                ));
            }
        }
        let written: HashMap<&str, &StoredDocument> = result.success.iter().map(|s| (s.id(), s)).collect();

        let mut meta = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            let PendingResolution { real_master, resolved } = resolution;
            match written.get(resolved.id.as_str()) {
                Some(stored) if !self.conflict_handler.is_equal(&resolved, &real_master) => {
                    meta.push(AssumedMasterState::with_resolved_conflict(real_master, stored.rev.clone()));
                }
                Some(_) => meta.push(AssumedMasterState::new(real_master)),
                None => {
                    // A local write raced the resolution; it is pushed next
                    // against the master state we now know.
                    debug!(id = %resolved.id, "Resolution lost to a concurrent local write");
                    meta.push(AssumedMasterState::new(real_master));
                }
            }
        }
        Ok(meta)
    }
}

impl std::fmt::Debug for PushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushEngine")
            .field("replication_id", &self.replication_id)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::MasterWins;
    use crate::handler::StorageMaster;
    use crate::storage::{BoxFuture, MemoryStorage};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every call and rejects nothing.
    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<Vec<PushRow>>>,
    }

    impl PushHandler for RecordingHandler {
        fn push(&self, rows: Vec<PushRow>) -> BoxFuture<'_, Vec<Document>> {
            self.calls.lock().unwrap().push(rows);
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    struct Setup {
        fork: Arc<MemoryStorage>,
        store: Arc<CheckpointStore>,
        events: ReplicationEvents,
        cancel: watch::Sender<bool>,
        canceled: watch::Receiver<bool>,
    }

    async fn setup() -> Setup {
        let (cancel, canceled) = watch::channel(false);
        Setup {
            fork: Arc::new(MemoryStorage::new("fork")),
            store: Arc::new(CheckpointStore::in_memory().await.unwrap()),
            events: ReplicationEvents::new(),
            cancel,
            canceled,
        }
    }

    fn engine(s: &Setup, handler: Arc<dyn PushHandler>, batch_size: usize) -> PushEngine {
        PushEngine::new(
            "repl",
            s.fork.clone(),
            handler,
            Arc::new(MasterWins),
            s.store.clone(),
            s.events.clone(),
            batch_size,
            s.canceled.clone(),
        )
    }

    #[tokio::test]
    async fn test_push_batches_and_records_meta() {
        let s = setup().await;
        for i in 0..25 {
            s.fork.upsert(Document::new(format!("d{i:02}"))).await.unwrap();
        }
        let handler = Arc::new(RecordingHandler::default());
        let report = engine(&s, handler.clone(), 10).push_once().await.unwrap();

        let sizes: Vec<usize> = handler.calls.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(report.documents, 25);
        assert_eq!(report.batches, 3);
        assert_eq!(s.store.meta_count("repl").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_second_cycle_pushes_nothing() {
        let s = setup().await;
        s.fork.upsert(Document::new("a")).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let engine = engine(&s, handler.clone(), 10);

        engine.push_once().await.unwrap();
        let report = engine.push_once().await.unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(handler.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_push_has_no_assumed_state_then_uses_meta() {
        let s = setup().await;
        s.fork.upsert(Document::new("a").with_field("v", 1)).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let engine = engine(&s, handler.clone(), 10);
        engine.push_once().await.unwrap();

        s.fork.upsert(Document::new("a").with_field("v", 2)).await.unwrap();
        engine.push_once().await.unwrap();

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls[0][0].assumed_master_state, None);
        assert_eq!(
            calls[1][0].assumed_master_state,
            Some(Document::new("a").with_field("v", 1))
        );
    }

    #[tokio::test]
    async fn test_conflict_with_master_wins_adopts_master() {
        let s = setup().await;
        let master = Arc::new(StorageMaster::new(Arc::new(MemoryStorage::new("master")), Arc::new(MasterWins)));
        master.storage().upsert(Document::new("x").with_field("owner", "master")).await.unwrap();
        s.fork.upsert(Document::new("x").with_field("owner", "fork")).await.unwrap();

        let mut resolved_rx = s.events.resolved_conflicts.subscribe();
        let report = engine(&s, master.clone(), 10).push_once().await.unwrap();

        assert_eq!(report.conflicts, 1);
        let fork_doc = s.fork.get("x").await.unwrap();
        assert_eq!(fork_doc.doc.get("owner"), Some(&json!("master")));
        // Equal to master: no pending resolution, nothing left to push
        let meta = s.store.assumed_master_states("repl", &["x".to_string()]).await.unwrap();
        assert_eq!(meta["x"].resolved_conflict_rev, None);
        assert_eq!(resolved_rx.recv().await.unwrap().direction, Direction::Up);
    }

    #[tokio::test]
    async fn test_merged_resolution_is_pushed_in_same_cycle() {
        use crate::conflict::FnConflictHandler;

        let s = setup().await;
        let handler = Arc::new(FnConflictHandler::new(|input: &ConflictInput| {
            let mut merged = input.real_master_state.clone();
            merged.fields.insert("merged".into(), json!(true));
            merged
        }));
        let master = Arc::new(StorageMaster::new(Arc::new(MemoryStorage::new("master")), handler.clone()));
        master.storage().upsert(Document::new("x").with_field("v", 1)).await.unwrap();
        s.fork.upsert(Document::new("x").with_field("v", 2)).await.unwrap();

        let engine = PushEngine::new(
            "repl",
            s.fork.clone(),
            master.clone(),
            handler,
            s.store.clone(),
            s.events.clone(),
            10,
            s.canceled.clone(),
        );
        engine.push_once().await.unwrap();

        let on_master = master.storage().get("x").await.unwrap().doc;
        assert_eq!(on_master.get("merged"), Some(&json!(true)));
        assert_eq!(on_master, s.fork.get("x").await.unwrap().doc);
    }

    #[tokio::test]
    async fn test_handler_error_keeps_checkpoint() {
        struct Failing;
        impl PushHandler for Failing {
            fn push(&self, _rows: Vec<PushRow>) -> BoxFuture<'_, Vec<Document>> {
                Box::pin(async { Err(ReplicationError::push_msg("503")) })
            }
        }

        let s = setup().await;
        s.fork.upsert(Document::new("a")).await.unwrap();
        let err = engine(&s, Arc::new(Failing), 10).push_once().await.unwrap_err();
        assert!(matches!(err, ReplicationError::PushHandler { .. }));
        assert!(s.store.get_checkpoint("repl", Direction::Up).await.is_none());
        assert_eq!(s.store.meta_count("repl").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_batch() {
        let s = setup().await;
        s.fork.upsert(Document::new("a")).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let engine = engine(&s, handler.clone(), 10);
        s.cancel.send_replace(true);

        let report = engine.push_once().await.unwrap();
        assert!(report.canceled);
        assert!(handler.calls.lock().unwrap().is_empty());
    }
}

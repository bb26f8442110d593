// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull engine: master → fork.
//!
//! Each cycle pages through master from the down checkpoint until master
//! returns an empty page. A batch is applied in three steps, and batch
//! N+1 is never requested before batch N is committed:
//!
//! 1. Decide per document (see below)
//! 2. Write to the fork (`PullApply` / `ConflictResolution` context)
//! 3. Commit meta + down checkpoint in one transaction
//!
//! A crash between 2 and 3 re-pulls the batch; the fork then already
//! equals master and only meta is written.
//!
//! # Per-Document Decision
//!
//! ```text
//! resolved_conflict_rev == fork.rev       → skip (push side owns it)
//! fork == incoming                        → meta only (if changed)
//! fork ≠ assumed, assumed == incoming     → skip (unpushed write, master unchanged)
//! fork exists, assumed missing or ≠ fork  → conflict: resolve(fork, assumed, incoming)
//! otherwise                               → overwrite fork (CAS on fork rev)
//! ```
//!
//! A 409 on the fork write means a local write raced the pull. That
//! document is skipped; its local write is pushed and resolved later.

use crate::checkpoint::{AssumedMasterState, CheckpointStore};
use crate::conflict::{resolve_for, ConflictHandler, ConflictInput, ConflictOutcome, ResolvedConflict};
use crate::coordinator::{CycleReport, ReplicationEvents};
use crate::document::{Checkpoint, Direction, Document, StoredDocument};
use crate::error::{ReplicationError, Result};
use crate::handler::{PullBatch, PullHandler};
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::storage::{BulkWriteResult, BulkWriteRow, ForkStorage, WriteContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Master → fork replication for one replication identifier.
pub struct PullEngine {
    replication_id: String,
    fork: Arc<dyn ForkStorage>,
    handler: Arc<dyn PullHandler>,
    conflict_handler: Arc<dyn ConflictHandler>,
    store: Arc<CheckpointStore>,
    events: ReplicationEvents,
    batch_size: usize,
    rate_limiter: Option<Arc<RateLimiter>>,
    canceled: watch::Receiver<bool>,
}

/// What to do with one incoming document.
enum Decision {
    Skip,
    MetaOnly,
    Overwrite { previous: Option<StoredDocument> },
    Conflict { fork: StoredDocument },
}

/// Fork writes planned for one batch, with the master state each mirrors.
#[derive(Default)]
struct Plan {
    meta: Vec<AssumedMasterState>,
    overwrites: Vec<(BulkWriteRow, Document)>,
    resolutions: Vec<(BulkWriteRow, Document)>,
    skipped: usize,
    conflicts: usize,
}

impl PullEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replication_id: impl Into<String>,
        fork: Arc<dyn ForkStorage>,
        handler: Arc<dyn PullHandler>,
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

    /// Throttle pull handler calls.
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

    /// Pull every master change after the down checkpoint.
    pub async fn pull_once(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        loop {
            if self.is_canceled() {
                debug!(replication_id = %self.replication_id, "Pull cycle stopped by cancel");
                report.canceled = true;
                break;
            }

            let current = self.store.get_checkpoint(&self.replication_id, Direction::Down).await;
            let batch = self.fetch(current.clone()).await?;

            if batch.documents.is_empty() {
                self.record_caught_up(current.as_ref(), batch.checkpoint).await?;
                break;
            }

            let checkpoint = match batch.checkpoint {
                Some(cp) if !cp.is_null() && Some(&cp) != current.as_ref() => cp,
                // Committing the batch would not move the cursor; the same
                // page would be fetched forever.
                _ => {
                    return Err(ReplicationError::malformed(
                        "pull_handler",
                        "non-empty batch without a new checkpoint",
                    ))
                }
            };

            self.apply_batch(batch.documents, checkpoint, &mut report).await?;
            report.batches += 1;
        }

        metrics::record_cycle(&self.replication_id, Direction::Down, report.batches, started.elapsed());
        Ok(report)
    }

    /// Call the pull handler and validate its response.
    async fn fetch(&self, checkpoint: Option<Checkpoint>) -> Result<PullBatch> {
        if let Some(ref limiter) = self.rate_limiter {
            limiter.acquire().await;
        }

        let call_start = Instant::now();
        let result = self.handler.pull(checkpoint, self.batch_size).await;
        metrics::record_handler_call(&self.replication_id, Direction::Down, call_start.elapsed(), result.is_ok());
        let batch = result?;

        if batch.documents.iter().any(|d| d.id.is_empty()) {
            return Err(ReplicationError::malformed("pull_handler", "document without id"));
        }
        Ok(batch)
    }

    /// Empty page: master has nothing newer. Keep a changed cursor anyway.
    async fn record_caught_up(&self, current: Option<&Checkpoint>, returned: Option<Checkpoint>) -> Result<()> {
        match returned {
            Some(cp) if !cp.is_null() && Some(&cp) != current => {
                debug!(replication_id = %self.replication_id, "Empty pull page with new checkpoint");
                self.store
                    .set_checkpoint(&self.replication_id, Direction::Down, Some(&cp), &[])
                    .await
            }
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, documents, checkpoint, report), fields(replication_id = %self.replication_id, batch = documents.len()))]
    async fn apply_batch(
        &self,
        documents: Vec<Document>,
        checkpoint: Checkpoint,
        report: &mut CycleReport,
    ) -> Result<()> {
        let documents = dedup_latest(documents);
        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        let fork_docs = self.fork.find_by_ids(ids.clone()).await?;
        let assumed = self.store.assumed_master_states(&self.replication_id, &ids).await?;

        let mut plan = Plan::default();
        for incoming in documents {
            let fork_doc = fork_docs.get(&incoming.id);
            let meta = assumed.get(&incoming.id);

            match self.decide(&incoming, fork_doc, meta) {
                Decision::Skip => plan.skipped += 1,
                Decision::MetaOnly => {
                    plan.skipped += 1;
                    let unchanged = meta.is_some_and(|m| {
                        m.resolved_conflict_rev.is_none() && self.conflict_handler.is_equal(&m.document, &incoming)
                    });
                    if !unchanged {
                        plan.meta.push(AssumedMasterState::new(incoming));
                    }
                }
                Decision::Overwrite { previous } => {
                    let row = BulkWriteRow {
                        document: incoming.clone(),
                        previous: previous.map(|p| p.rev),
                    };
                    plan.overwrites.push((row, incoming));
                }
                Decision::Conflict { fork } => {
                    plan.conflicts += 1;
                    self.resolve(fork, meta.map(|m| m.document.clone()), incoming, &mut plan)
                        .await?;
                }
            }
        }

        let applied = self.write_overwrites(std::mem::take(&mut plan.overwrites), &mut plan.meta).await?;
        self.write_resolutions(std::mem::take(&mut plan.resolutions), &mut plan.meta)
            .await?;

        self.store
            .set_checkpoint(&self.replication_id, Direction::Down, Some(&checkpoint), &plan.meta)
            .await?;

        report.documents += applied.len();
        report.skipped += plan.skipped;
        report.conflicts += plan.conflicts;
        metrics::record_documents_pulled(&self.replication_id, applied.len());
        metrics::record_documents_skipped(&self.replication_id, Direction::Down, "in_sync", plan.skipped);
        debug!(applied = applied.len(), skipped = plan.skipped, conflicts = plan.conflicts, "Pull batch committed");

        for doc in applied {
            self.events.emit_received(doc);
        }
        Ok(())
    }

    fn decide(
        &self,
        incoming: &Document,
        fork_doc: Option<&StoredDocument>,
        meta: Option<&AssumedMasterState>,
    ) -> Decision {
        let Some(fork) = fork_doc else {
            return Decision::Overwrite { previous: None };
        };

        if meta.and_then(|m| m.resolved_conflict_rev.as_ref()) == Some(&fork.rev) {
            return Decision::Skip;
        }
        if self.conflict_handler.is_equal(&fork.doc, incoming) {
            return Decision::MetaOnly;
        }
        let unpushed_local_write = match meta {
            None => true,
            Some(m) => !self.conflict_handler.is_equal(&m.document, &fork.doc),
        };
        if unpushed_local_write {
            // Master has not moved since the fork last saw it; push sends
            // the local write against the unchanged assumed state.
            if meta.is_some_and(|m| self.conflict_handler.is_equal(&m.document, incoming)) {
                return Decision::Skip;
            }
            Decision::Conflict { fork: fork.clone() }
        } else {
            Decision::Overwrite {
                previous: Some(fork.clone()),
            }
        }
    }

    async fn resolve(
        &self,
        fork: StoredDocument,
        assumed: Option<Document>,
        incoming: Document,
        plan: &mut Plan,
    ) -> Result<()> {
        let input = ConflictInput {
            new_document_state: fork.doc,
            assumed_master_state: assumed,
            real_master_state: incoming,
        };
        let outcome = resolve_for(self.conflict_handler.as_ref(), &input, Direction::Down).await?;

        match &outcome {
            ConflictOutcome::Equal => {
                metrics::record_conflict(&self.replication_id, Direction::Down, "equal");
                plan.meta.push(AssumedMasterState::new(input.real_master_state.clone()));
            }
            ConflictOutcome::Resolved(doc) => {
                metrics::record_conflict(&self.replication_id, Direction::Down, "resolved");
                let row = BulkWriteRow {
                    document: doc.clone(),
                    previous: Some(fork.rev),
                };
                plan.resolutions.push((row, input.real_master_state.clone()));
            }
        }

        self.events.emit_resolved(ResolvedConflict {
            direction: Direction::Down,
            input,
            outcome,
        });
        Ok(())
    }

    /// Apply master state to the fork. Returns the documents written.
    async fn write_overwrites(
        &self,
        overwrites: Vec<(BulkWriteRow, Document)>,
        meta: &mut Vec<AssumedMasterState>,
    ) -> Result<Vec<Document>> {
        if overwrites.is_empty() {
            return Ok(Vec::new());
        }
        let (rows, masters): (Vec<_>, Vec<_>) = overwrites.into_iter().unzip();
        let result = self.fork.bulk_write(rows, WriteContext::PullApply).await?;
        let written = self.written_ids(&result, "apply_pull")?;

        let mut applied = Vec::with_capacity(written.len());
        for master in masters {
            if written.contains_key(master.id.as_str()) {
                meta.push(AssumedMasterState::new(master.clone()));
                applied.push(master);
            }
        }
        Ok(applied)
    }

    /// Write conflict resolutions to the fork.
    ///
    /// A resolution that differs from master records its fork revision, so
    /// the next pull leaves it alone until it was pushed.
    async fn write_resolutions(
        &self,
        resolutions: Vec<(BulkWriteRow, Document)>,
        meta: &mut Vec<AssumedMasterState>,
    ) -> Result<()> {
        if resolutions.is_empty() {
            return Ok(());
        }
        let resolved: Vec<Document> = resolutions.iter().map(|(row, _)| row.document.clone()).collect();
        let (rows, masters): (Vec<_>, Vec<_>) = resolutions.into_iter().unzip();
        let result = self.fork.bulk_write(rows, WriteContext::ConflictResolution).await?;
        let written = self.written_ids(&result, "write_resolution")?;

        for (doc, master) in resolved.into_iter().zip(masters) {
            let Some(rev) = written.get(doc.id.as_str()) else {
                continue;
            };
            if self.conflict_handler.is_equal(&doc, &master) {
                meta.push(AssumedMasterState::new(master));
            } else {
                meta.push(AssumedMasterState::with_resolved_conflict(master, (*rev).clone()));
            }
        }
        Ok(())
    }

    /// Ids written successfully, mapped to their new revision.
    ///
    /// Revision mismatches are skipped for this batch; any other rejected
    /// row aborts it.
    fn written_ids<'a>(
        &self,
        result: &'a BulkWriteResult,
        operation: &str,
    ) -> Result<HashMap<&'a str, &'a crate::document::Revision>> {
        for error in &result.errors {
            if error.is_conflict() {
                warn!(
                    replication_id = %self.replication_id,
                    id = %error.id,
                    "Concurrent local write, skipping document for this batch"
                );
                metrics::record_documents_skipped(&self.replication_id, Direction::Down, "cas_race", 1);
            } else {
                return Err(ReplicationError::storage(operation, format!("{}: {}", error.id, error.message)));
            }
        }
        Ok(result.success.iter().map(|s| (s.id(), &s.rev)).collect())
    }
}

/// Keep the last occurrence of every id, in first-seen order.
fn dedup_latest(documents: Vec<Document>) -> Vec<Document> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(documents.len());
    let mut out: Vec<Document> = Vec::with_capacity(documents.len());
    for doc in documents {
        match index.get(&doc.id) {
            Some(&i) => out[i] = doc,
            None => {
                index.insert(doc.id.clone(), out.len());
                out.push(doc);
            }
        }
    }
    out
}

impl std::fmt::Debug for PullEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullEngine")
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

    struct Setup {
        fork: Arc<MemoryStorage>,
        master: Arc<StorageMaster<MemoryStorage>>,
        store: Arc<CheckpointStore>,
        events: ReplicationEvents,
        cancel: watch::Sender<bool>,
    }

    async fn setup() -> Setup {
        Setup {
            fork: Arc::new(MemoryStorage::new("fork")),
            master: Arc::new(StorageMaster::new(Arc::new(MemoryStorage::new("master")), Arc::new(MasterWins))),
            store: Arc::new(CheckpointStore::in_memory().await.unwrap()),
            events: ReplicationEvents::new(),
            cancel: watch::channel(false).0,
        }
    }

    fn engine_with(s: &Setup, handler: Arc<dyn PullHandler>, batch_size: usize) -> PullEngine {
        PullEngine::new(
            "repl",
            s.fork.clone(),
            handler,
            Arc::new(MasterWins),
            s.store.clone(),
            s.events.clone(),
            batch_size,
            s.cancel.subscribe(),
        )
    }

    fn engine(s: &Setup, batch_size: usize) -> PullEngine {
        engine_with(s, s.master.clone(), batch_size)
    }

    /// Serves fixed pages in order, then empty pages.
    struct ScriptedPull {
        pages: Mutex<Vec<PullBatch>>,
    }

    impl PullHandler for ScriptedPull {
        fn pull(&self, checkpoint: Option<Checkpoint>, _batch_size: usize) -> BoxFuture<'_, PullBatch> {
            let mut pages = self.pages.lock().unwrap();
            let page = if pages.is_empty() {
                PullBatch {
                    documents: Vec::new(),
                    checkpoint,
                }
            } else {
                pages.remove(0)
            };
            Box::pin(async move { Ok(page) })
        }
    }

    #[tokio::test]
    async fn test_pull_applies_all_pages() {
        let s = setup().await;
        for i in 0..7 {
            s.master.storage().upsert(Document::new(format!("d{i}"))).await.unwrap();
        }
        let report = engine(&s, 3).pull_once().await.unwrap();

        assert_eq!(report.documents, 7);
        assert_eq!(report.batches, 3);
        assert_eq!(s.fork.len().await, 7);
        assert_eq!(s.store.meta_count("repl").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_repull_is_meta_only_noop() {
        let s = setup().await;
        s.master.storage().upsert(Document::new("a").with_field("v", 1)).await.unwrap();
        let engine = engine(&s, 10);
        engine.pull_once().await.unwrap();
        let rev_before = s.fork.get("a").await.unwrap().rev;

        // Simulate a crash before the checkpoint commit
        s.store.delete("repl").await.unwrap();
        let report = engine.pull_once().await.unwrap();

        assert_eq!(report.documents, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(s.fork.get("a").await.unwrap().rev, rev_before);
        assert_eq!(s.store.meta_count("repl").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_is_kept() {
        let s = setup().await;
        s.master.storage().upsert(Document::new("a")).await.unwrap();
        let engine = engine(&s, 10);
        engine.pull_once().await.unwrap();

        s.master.storage().remove("a").await.unwrap();
        engine.pull_once().await.unwrap();

        let doc = s.fork.get("a").await.unwrap();
        assert!(doc.doc.deleted);
    }

    #[tokio::test]
    async fn test_unpushed_local_write_conflicts() {
        let s = setup().await;
        s.master.storage().upsert(Document::new("x").with_field("v", "master")).await.unwrap();
        s.fork.upsert(Document::new("x").with_field("v", "fork")).await.unwrap();

        let mut resolved = s.events.resolved_conflicts.subscribe();
        let report = engine(&s, 10).pull_once().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(s.fork.get("x").await.unwrap().doc.get("v"), Some(&json!("master")));
        let event = resolved.recv().await.unwrap();
        assert_eq!(event.direction, Direction::Down);
        assert_eq!(event.input.new_document_state.get("v"), Some(&json!("fork")));
    }

    #[tokio::test]
    async fn test_unpushed_write_survives_pull_of_unchanged_master() {
        let s = setup().await;
        let push = crate::push::PushEngine::new(
            "repl",
            s.fork.clone(),
            s.master.clone(),
            Arc::new(MasterWins),
            s.store.clone(),
            s.events.clone(),
            10,
            s.cancel.subscribe(),
        );
        s.fork.upsert(Document::new("x").with_field("v", "A")).await.unwrap();
        push.push_once().await.unwrap();

        // Local edit lands before the echo of A is pulled
        let edited = s.fork.upsert(Document::new("x").with_field("v", "F")).await.unwrap();
        let report = engine(&s, 10).pull_once().await.unwrap();

        assert_eq!(report.conflicts, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(s.fork.get("x").await.unwrap().rev, edited.rev);
        let meta = s.store.assumed_master_states("repl", &["x".to_string()]).await.unwrap();
        assert_eq!(meta["x"].document.get("v"), Some(&json!("A")));

        push.push_once().await.unwrap();
        assert_eq!(s.master.storage().get("x").await.unwrap().doc.get("v"), Some(&json!("F")));
        assert_eq!(s.fork.get("x").await.unwrap().doc.get("v"), Some(&json!("F")));
    }

    #[tokio::test]
    async fn test_pending_resolution_is_not_overwritten() {
        let s = setup().await;
        let stored = s.fork.upsert(Document::new("x").with_field("v", "merged")).await.unwrap();
        s.store
            .set_checkpoint(
                "repl",
                Direction::Down,
                None,
                &[AssumedMasterState::with_resolved_conflict(
                    Document::new("x").with_field("v", "old"),
                    stored.rev.clone(),
                )],
            )
            .await
            .unwrap();
        s.master.storage().upsert(Document::new("x").with_field("v", "new")).await.unwrap();

        let report = engine(&s, 10).pull_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(s.fork.get("x").await.unwrap().rev, stored.rev);
    }

    #[tokio::test]
    async fn test_empty_page_persists_changed_checkpoint() {
        let s = setup().await;
        let handler = Arc::new(ScriptedPull {
            pages: Mutex::new(vec![PullBatch {
                documents: Vec::new(),
                checkpoint: Some(Checkpoint::new(json!({"seq": 9}))),
            }]),
        });
        engine_with(&s, handler, 10).pull_once().await.unwrap();
        assert_eq!(
            s.store.get_checkpoint("repl", Direction::Down).await,
            Some(Checkpoint::new(json!({"seq": 9})))
        );
    }

    #[tokio::test]
    async fn test_malformed_document_aborts_without_checkpoint() {
        let s = setup().await;
        let handler = Arc::new(ScriptedPull {
            pages: Mutex::new(vec![PullBatch {
                documents: vec![Document::new("ok"), Document::new("")],
                checkpoint: Some(Checkpoint::new(json!({"seq": 1}))),
            }]),
        });
        let err = engine_with(&s, handler, 10).pull_once().await.unwrap_err();
        assert!(matches!(err, ReplicationError::MalformedResponse { .. }));
        assert!(s.fork.is_empty().await);
        assert!(s.store.get_checkpoint("repl", Direction::Down).await.is_none());
    }

    #[tokio::test]
    async fn test_non_advancing_checkpoint_is_malformed() {
        let s = setup().await;
        let handler = Arc::new(ScriptedPull {
            pages: Mutex::new(vec![PullBatch {
                documents: vec![Document::new("a")],
                checkpoint: None,
            }]),
        });
        let err = engine_with(&s, handler, 10).pull_once().await.unwrap_err();
        assert!(matches!(err, ReplicationError::MalformedResponse { .. }));
    }

    #[test]
    fn test_dedup_latest_wins() {
        let docs = vec![
            Document::new("a").with_field("v", 1),
            Document::new("b"),
            Document::new("a").with_field("v", 2),
        ];
        let out = dedup_latest(docs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("v"), Some(&json!(2)));
        assert_eq!(out[1].id, "b");
    }
}

//! Recording and failure-injecting handlers.
//!
//! Each wrapper records every call for assertions and can fail a
//! configurable number of leading calls before delegating to an inner
//! handler.

use replication_protocol::conflict::{ConflictHandler, ConflictInput, ConflictOutcome, MasterWins};
use replication_protocol::handler::MasterStream;
use replication_protocol::storage::{
    BoxFuture, BulkWriteResult, BulkWriteRow, ChangeEvent, ChangedDocuments, ForkStorage, WriteContext, WriteError,
};
use replication_protocol::{
    Checkpoint, Document, PullBatch, PullHandler, PushHandler, PushRow, ReplicationError, StoredDocument,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;

/// Decrement `remaining` if positive. Returns whether a failure is due.
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A recorded push() call.
#[derive(Debug, Clone)]
pub struct PushCall {
    pub rows: Vec<PushRow>,
    pub at: Instant,
    pub failed: bool,
}

/// Push handler that records calls and fails the first N of them.
///
/// Accepts everything when built without an inner handler.
pub struct RecordingPush {
    inner: Option<Arc<dyn PushHandler>>,
    calls: Mutex<Vec<PushCall>>,
    fail_remaining: AtomicUsize,
}

impl RecordingPush {
    pub fn accept_all() -> Arc<Self> {
        Self::build(None, 0)
    }

    pub fn wrapping(inner: Arc<dyn PushHandler>) -> Arc<Self> {
        Self::build(Some(inner), 0)
    }

    pub fn failing_first(fail: usize) -> Arc<Self> {
        Self::build(None, fail)
    }

    pub fn wrapping_failing_first(inner: Arc<dyn PushHandler>, fail: usize) -> Arc<Self> {
        Self::build(Some(inner), fail)
    }

    fn build(inner: Option<Arc<dyn PushHandler>>, fail: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(fail),
        })
    }

    pub fn calls(&self) -> Vec<PushCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Batch sizes of the successful calls.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls().iter().filter(|c| !c.failed).map(|c| c.rows.len()).collect()
    }
}

impl PushHandler for RecordingPush {
    fn push(&self, rows: Vec<PushRow>) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let failed = take_failure(&self.fail_remaining);
            self.calls.lock().unwrap().push(PushCall {
                rows: rows.clone(),
                at: Instant::now(),
                failed,
            });
            if failed {
                return Err(ReplicationError::push_msg("injected push failure"));
            }
            match &self.inner {
                Some(inner) => inner.push(rows).await,
                None => Ok(Vec::new()),
            }
        })
    }
}

/// A recorded pull() call.
#[derive(Debug, Clone)]
pub struct PullCall {
    pub checkpoint: Option<Checkpoint>,
    pub returned: usize,
    pub failed: bool,
}

/// Pull handler that records calls and fails the first N of them.
pub struct RecordingPull {
    inner: Arc<dyn PullHandler>,
    calls: Mutex<Vec<PullCall>>,
    fail_remaining: AtomicUsize,
    /// Pages returned before delegating (for malformed responses).
    scripted: Mutex<Vec<PullBatch>>,
}

impl RecordingPull {
    pub fn wrapping(inner: Arc<dyn PullHandler>) -> Arc<Self> {
        Self::build(inner, 0, Vec::new())
    }

    pub fn failing_first(inner: Arc<dyn PullHandler>, fail: usize) -> Arc<Self> {
        Self::build(inner, fail, Vec::new())
    }

    /// Serve `pages` first, then delegate.
    pub fn scripted(inner: Arc<dyn PullHandler>, pages: Vec<PullBatch>) -> Arc<Self> {
        Self::build(inner, 0, pages)
    }

    fn build(inner: Arc<dyn PullHandler>, fail: usize, pages: Vec<PullBatch>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(fail),
            scripted: Mutex::new(pages),
        })
    }

    pub fn calls(&self) -> Vec<PullCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, checkpoint: Option<Checkpoint>, returned: usize, failed: bool) {
        self.calls.lock().unwrap().push(PullCall {
            checkpoint,
            returned,
            failed,
        });
    }
}

impl PullHandler for RecordingPull {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> BoxFuture<'_, PullBatch> {
        Box::pin(async move {
            if take_failure(&self.fail_remaining) {
                self.record(checkpoint, 0, true);
                return Err(ReplicationError::pull_msg("injected pull failure"));
            }
            let scripted = {
                let mut pages = self.scripted.lock().unwrap();
                (!pages.is_empty()).then(|| pages.remove(0))
            };
            let batch = match scripted {
                Some(page) => page,
                None => self.inner.pull(checkpoint.clone(), batch_size).await?,
            };
            self.record(checkpoint, batch.documents.len(), false);
            Ok(batch)
        })
    }

    fn stream(&self) -> Option<MasterStream> {
        self.inner.stream()
    }
}

/// Master-wins handler whose first N resolutions fail.
pub struct FlakyConflictHandler {
    fail_remaining: AtomicUsize,
    pub resolved: AtomicUsize,
}

impl FlakyConflictHandler {
    pub fn failing_first(fail: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(fail),
            resolved: AtomicUsize::new(0),
        })
    }
}

impl ConflictHandler for FlakyConflictHandler {
    fn resolve<'a>(&'a self, input: &'a ConflictInput, context: &'a str) -> BoxFuture<'a, ConflictOutcome> {
        Box::pin(async move {
            if take_failure(&self.fail_remaining) {
                return Err(ReplicationError::Internal("merge service unavailable".to_string()));
            }
            self.resolved.fetch_add(1, Ordering::SeqCst);
            MasterWins.resolve(input, context).await
        })
    }
}

/// Fork storage whose first N bulk writes reject every row with a 500.
pub struct FailingWrites {
    inner: Arc<dyn ForkStorage>,
    fail_remaining: AtomicUsize,
}

impl FailingWrites {
    pub fn new(inner: Arc<dyn ForkStorage>, fail: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_remaining: AtomicUsize::new(fail),
        })
    }
}

impl ForkStorage for FailingWrites {
    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: WriteContext) -> BoxFuture<'_, BulkWriteResult> {
        Box::pin(async move {
            if take_failure(&self.fail_remaining) {
                let errors = rows
                    .into_iter()
                    .map(|row| WriteError {
                        id: row.document.id,
                        status: 500,
                        document_in_db: None,
                        message: "disk full".to_string(),
                    })
                    .collect();
                return Ok(BulkWriteResult {
                    success: Vec::new(),
                    errors,
                });
            }
            self.inner.bulk_write(rows, context).await
        })
    }

    fn find_by_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashMap<String, StoredDocument>> {
        self.inner.find_by_ids(ids)
    }

    fn changed_since(
        &self,
        limit: usize,
        checkpoint: Option<replication_protocol::document::ForkCheckpoint>,
    ) -> BoxFuture<'_, ChangedDocuments> {
        self.inner.changed_since(limit, checkpoint)
    }

    fn change_stream(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.inner.change_stream()
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication state machine.
//!
//! [`ReplicationState`] is the handle a host keeps for one replication. It
//! ties together:
//! - the fork storage and the master handlers
//! - the [`CheckpointStore`] (opened on `start()` unless injected)
//! - one [`EngineDriver`](crate::live) per enabled direction
//! - live listeners (fork change stream, master stream, resync interval)
//! - event channels and lifecycle watches
//!
//! # Lifecycle
//!
//! 1. `start()` opens the checkpoint store, spawns the drivers, subscribes
//!    to change streams and queues the initial cycle of each engine
//! 2. Drivers retry failed cycles with backoff until canceled
//! 3. `cancel()` stops new batches, drains in-flight ones (bounded by the
//!    drain timeout) and closes an owned checkpoint store
//!
//! Without `live`, the replication cancels itself after the initial
//! replication.

mod types;

pub use types::{
    Activity, CycleReport, Failures, FirstSync, ReplicationEvents, ReplicationPhase, ReplicationStatus,
};

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicationConfig;
use crate::conflict::{ConflictHandler, MasterWins, ResolvedConflict};
use crate::document::{Direction, Document};
use crate::error::{ReplicationError, Result};
use crate::handler::{PullHandler, PushHandler};
use crate::live::{self, EngineDriver, Trigger, TriggerReason};
use crate::metrics;
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::resilience::RateLimiter;
use crate::storage::ForkStorage;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Watches and events shared by the handle, the drivers and the listeners.
pub(crate) struct Shared {
    pub(crate) replication_id: String,
    pub(crate) phase: watch::Sender<ReplicationPhase>,
    pub(crate) canceled: watch::Sender<bool>,
    pub(crate) paused: watch::Sender<bool>,
    pub(crate) activity: watch::Sender<Activity>,
    pub(crate) first_sync: watch::Sender<FirstSync>,
    /// Triggers queued or being served, both directions.
    pub(crate) pending: watch::Sender<usize>,
    pub(crate) failures: watch::Sender<Failures>,
    pub(crate) events: ReplicationEvents,
}

impl Shared {
    pub(crate) fn new(replication_id: impl Into<String>) -> Self {
        Self {
            replication_id: replication_id.into(),
            phase: watch::channel(ReplicationPhase::Created).0,
            canceled: watch::channel(false).0,
            paused: watch::channel(false).0,
            activity: watch::channel(Activity::default()).0,
            first_sync: watch::channel(FirstSync::default()).0,
            pending: watch::channel(0).0,
            failures: watch::channel(Failures::default()).0,
            events: ReplicationEvents::new(),
        }
    }

    pub(crate) fn set_phase(&self, phase: ReplicationPhase) {
        self.phase.send_replace(phase);
        metrics::set_replication_phase(&self.replication_id, &phase.to_string());
    }

    pub(crate) fn set_active(&self, direction: Direction, active: bool) {
        self.activity.send_modify(|a| a.set(direction, active));
        let any = !self.activity.borrow().is_idle();
        metrics::set_replication_active(&self.replication_id, any);
    }

    pub(crate) fn mark_first_sync(&self, direction: Direction) {
        let marked = self.first_sync.send_if_modified(|f| {
            let before = *f;
            f.mark(direction);
            before != *f
        });
        if marked {
            info!(replication_id = %self.replication_id, %direction, "Initial replication done");
        }
    }

    /// Record consecutive failures and move between Running and Retrying.
    pub(crate) fn set_failures(&self, direction: Direction, count: usize) {
        self.failures.send_if_modified(|f| {
            let before = *f;
            f.set(direction, count);
            before != *f
        });
        let failing = self.failures.borrow().any();

        let mut moved_to = None;
        self.phase.send_if_modified(|p| {
            let next = match (*p, failing) {
                (ReplicationPhase::Running, true) => ReplicationPhase::Retrying,
                (ReplicationPhase::Retrying, false) => ReplicationPhase::Running,
                _ => return false,
            };
            *p = next;
            moved_to = Some(next);
            true
        });
        if let Some(phase) = moved_to {
            metrics::set_replication_phase(&self.replication_id, &phase.to_string());
        }
    }

    fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }
}

/// Everything needed to build a [`ReplicationState`].
pub struct ReplicationOptions {
    pub config: ReplicationConfig,
    pub fork: Arc<dyn ForkStorage>,
    pub pull: Option<Arc<dyn PullHandler>>,
    pub push: Option<Arc<dyn PushHandler>>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
    /// Shared store; the replication opens (and closes) its own otherwise.
    pub checkpoint_store: Option<Arc<CheckpointStore>>,
}

impl ReplicationOptions {
    /// Options with no handlers and [`MasterWins`] conflict resolution.
    pub fn new(config: ReplicationConfig, fork: Arc<dyn ForkStorage>) -> Self {
        Self {
            config,
            fork,
            pull: None,
            push: None,
            conflict_handler: Arc::new(MasterWins),
            checkpoint_store: None,
        }
    }

    pub fn with_pull(mut self, handler: Arc<dyn PullHandler>) -> Self {
        self.pull = Some(handler);
        self
    }

    pub fn with_push(mut self, handler: Arc<dyn PushHandler>) -> Self {
        self.push = Some(handler);
        self
    }

    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = handler;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }
}

/// Tasks and resources that exist between `start()` and `cancel()`.
#[derive(Default)]
struct Runtime {
    store: Option<Arc<CheckpointStore>>,
    owns_store: bool,
    push_trigger: Option<Trigger>,
    pull_trigger: Option<Trigger>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: ReplicationConfig,
    fork: Arc<dyn ForkStorage>,
    pull: Option<Arc<dyn PullHandler>>,
    push: Option<Arc<dyn PushHandler>>,
    conflict_handler: Arc<dyn ConflictHandler>,
    injected_store: Option<Arc<CheckpointStore>>,
    shared: Arc<Shared>,
    runtime: Mutex<Runtime>,
}

/// Handle to one replication.
///
/// Cheap to clone; all clones control the same replication.
#[derive(Clone)]
pub struct ReplicationState {
    inner: Arc<Inner>,
}

impl ReplicationState {
    /// Validate options and create a replication in `Created`.
    ///
    /// Handlers whose direction is disabled in config are ignored. At least
    /// one direction must remain.
    pub fn new(options: ReplicationOptions) -> Result<Self> {
        let ReplicationOptions {
            config,
            fork,
            pull,
            push,
            conflict_handler,
            checkpoint_store,
        } = options;
        config.validate()?;

        let pull = pull.filter(|_| config.pull.enabled);
        let push = push.filter(|_| config.push.enabled);
        if pull.is_none() && push.is_none() {
            return Err(ReplicationError::Config(
                "replication needs a pull handler, a push handler, or both".to_string(),
            ));
        }

        let shared = Arc::new(Shared::new(config.replication_identifier.clone()));
        metrics::set_replication_phase(&shared.replication_id, "Created");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fork,
                pull,
                push,
                conflict_handler,
                injected_store: checkpoint_store,
                shared,
                runtime: Mutex::new(Runtime::default()),
            }),
        })
    }

    pub fn replication_identifier(&self) -> &str {
        &self.inner.config.replication_identifier
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ReplicationPhase {
        *self.inner.shared.phase.borrow()
    }

    /// Watch lifecycle changes.
    pub fn phase_receiver(&self) -> watch::Receiver<ReplicationPhase> {
        self.inner.shared.phase.subscribe()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.shared.is_canceled()
    }

    /// Flips to `true` exactly once, when the replication is canceled.
    pub fn canceled_receiver(&self) -> watch::Receiver<bool> {
        self.inner.shared.canceled.subscribe()
    }

    /// Which engines are running a cycle.
    pub fn active_receiver(&self) -> watch::Receiver<Activity> {
        self.inner.shared.activity.subscribe()
    }

    /// Documents applied to the fork by pull.
    pub fn subscribe_received(&self) -> broadcast::Receiver<Document> {
        self.inner.shared.events.received.subscribe()
    }

    /// Documents acknowledged by master.
    pub fn subscribe_sent(&self) -> broadcast::Receiver<Document> {
        self.inner.shared.events.sent.subscribe()
    }

    /// Every failed cycle.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<ReplicationError>> {
        self.inner.shared.events.errors.subscribe()
    }

    /// Every handled conflict.
    pub fn subscribe_resolved_conflicts(&self) -> broadcast::Receiver<ResolvedConflict> {
        self.inner.shared.events.resolved_conflicts.subscribe()
    }

    /// Checkpoint store in use, once started.
    pub async fn checkpoint_store(&self) -> Option<Arc<CheckpointStore>> {
        self.inner.runtime.lock().await.store.clone()
    }

    /// Snapshot for health endpoints. No I/O.
    pub fn status(&self) -> ReplicationStatus {
        let shared = &self.inner.shared;
        ReplicationStatus {
            replication_identifier: shared.replication_id.clone(),
            phase: *shared.phase.borrow(),
            activity: *shared.activity.borrow(),
            first_sync: *shared.first_sync.borrow(),
            pending_triggers: *shared.pending.borrow(),
            failures: *shared.failures.borrow(),
        }
    }

    /// Start replicating.
    ///
    /// 1. Opens the checkpoint store (unless one was injected)
    /// 2. Spawns an engine driver per direction
    /// 3. In live mode, subscribes to the fork and master streams
    /// 4. Queues the initial cycle of each engine
    ///
    /// Returns once everything is spawned; use
    /// [`await_initial_replication`](Self::await_initial_replication) to wait
    /// for the first cycles.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let shared = &inner.shared;
        let config = &inner.config;
        let replication_id = config.replication_identifier.clone();

        let mut actual = ReplicationPhase::Created;
        let moved = shared.phase.send_if_modified(|p| {
            actual = *p;
            if *p == ReplicationPhase::Created {
                *p = ReplicationPhase::Starting;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: actual.to_string(),
            });
        }
        metrics::set_replication_phase(&replication_id, "Starting");
        info!(
            replication_id = %replication_id,
            live = config.live,
            push = inner.push.is_some(),
            pull = inner.pull.is_some(),
            "Starting replication"
        );

        let (store, owns_store) = match &inner.injected_store {
            Some(store) => (Arc::clone(store), false),
            None => match CheckpointStore::open(&config.checkpoint).await {
                Ok(store) => (Arc::new(store), true),
                Err(e) => {
                    error!(replication_id = %replication_id, error = %e, "Failed to open checkpoint store");
                    shared.canceled.send_replace(true);
                    shared.set_phase(ReplicationPhase::Canceled);
                    return Err(e);
                }
            },
        };

        let mut rt = inner.runtime.lock().await;
        // cancel() may have run while the store was opening; it found
        // nothing to close and nothing to drain.
        if shared.is_canceled() {
            if owns_store {
                store.close().await;
            }
            info!(replication_id = %replication_id, "Canceled while starting");
            return Err(ReplicationError::Canceled);
        }
        rt.store = Some(Arc::clone(&store));
        rt.owns_store = owns_store;

        match &inner.push {
            Some(handler) => {
                let mut engine = PushEngine::new(
                    replication_id.clone(),
                    Arc::clone(&inner.fork),
                    Arc::clone(handler),
                    Arc::clone(&inner.conflict_handler),
                    Arc::clone(&store),
                    shared.events.clone(),
                    config.push.batch_size,
                    shared.canceled.subscribe(),
                );
                if let Some(limit) = config.push.rate_limit_config() {
                    info!(rate_per_sec = limit.refill_rate, burst = limit.burst_size, "Rate limiting push handler");
                    engine = engine.with_rate_limiter(Arc::new(RateLimiter::new(limit)));
                }

                let (trigger, rx) = Trigger::new(Direction::Up, Arc::clone(shared));
                let driver = EngineDriver::new(
                    Arc::new(engine),
                    rx,
                    Arc::clone(shared),
                    config.push.debounce_duration(),
                    config.retry.to_retry_config(),
                );
                let span = info_span!("push", replication_id = %replication_id);
                rt.tasks.push(tokio::spawn(driver.run().instrument(span)));
                rt.push_trigger = Some(trigger);
            }
            None => shared.mark_first_sync(Direction::Up),
        }

        match &inner.pull {
            Some(handler) => {
                let mut engine = PullEngine::new(
                    replication_id.clone(),
                    Arc::clone(&inner.fork),
                    Arc::clone(handler),
                    Arc::clone(&inner.conflict_handler),
                    Arc::clone(&store),
                    shared.events.clone(),
                    config.pull.batch_size,
                    shared.canceled.subscribe(),
                );
                if let Some(limit) = config.pull.rate_limit_config() {
                    info!(rate_per_sec = limit.refill_rate, burst = limit.burst_size, "Rate limiting pull handler");
                    engine = engine.with_rate_limiter(Arc::new(RateLimiter::new(limit)));
                }

                let (trigger, rx) = Trigger::new(Direction::Down, Arc::clone(shared));
                let driver = EngineDriver::new(
                    Arc::new(engine),
                    rx,
                    Arc::clone(shared),
                    config.pull.debounce_duration(),
                    config.retry.to_retry_config(),
                );
                let span = info_span!("pull", replication_id = %replication_id);
                rt.tasks.push(tokio::spawn(driver.run().instrument(span)));
                rt.pull_trigger = Some(trigger);
            }
            None => shared.mark_first_sync(Direction::Down),
        }

        if config.live {
            self.subscribe_live(&mut rt, &replication_id);
        }

        for trigger in rt.push_trigger.iter().chain(rt.pull_trigger.iter()) {
            trigger.fire(TriggerReason::Initial);
        }
        drop(rt);

        let failing = shared.failures.borrow().any();
        let running = shared.phase.send_if_modified(|p| {
            if *p != ReplicationPhase::Starting {
                return false;
            }
            *p = if failing {
                ReplicationPhase::Retrying
            } else {
                ReplicationPhase::Running
            };
            true
        });
        if running {
            metrics::set_replication_phase(&replication_id, &self.phase().to_string());
            info!(replication_id = %replication_id, "Replication running");
        }

        if !config.live {
            let state = self.clone();
            tokio::spawn(async move {
                if state.await_initial_replication().await.is_ok() {
                    info!(replication_id = %state.replication_identifier(), "One-shot replication done");
                    state.cancel().await;
                }
            });
        }

        Ok(())
    }

    /// Spawn the live listeners for every running direction.
    fn subscribe_live(&self, rt: &mut Runtime, replication_id: &str) {
        let inner = &self.inner;

        if let Some(trigger) = rt.push_trigger.clone() {
            match inner.fork.change_stream() {
                Some(changes) => rt.tasks.push(live::spawn_fork_listener(changes, trigger)),
                None => warn!(
                    replication_id = %replication_id,
                    "Fork storage has no change stream, push runs on re_sync() only"
                ),
            }
        }

        if let (Some(trigger), Some(handler)) = (rt.pull_trigger.clone(), inner.pull.as_ref()) {
            match handler.stream() {
                Some(stream) => rt.tasks.push(live::spawn_master_listener(stream, trigger.clone())),
                None => debug!(replication_id = %replication_id, "Pull handler has no stream"),
            }
            if let Some(period) = inner.config.pull.live_interval_duration() {
                info!(replication_id = %replication_id, interval = ?period, "Periodic resync enabled");
                rt.tasks.push(live::spawn_interval(period, trigger));
            }
        }
    }

    /// Stop replicating. Idempotent.
    ///
    /// Shutdown sequence:
    /// 1. Set the canceled flag (engines stop before their next batch)
    /// 2. Release triggers and listeners
    /// 3. Wait for in-flight batches, bounded by the drain timeout
    /// 4. Close the checkpoint store if this replication opened it
    pub async fn cancel(&self) {
        let shared = &self.inner.shared;
        if shared.canceled.send_replace(true) {
            return;
        }
        info!(replication_id = %shared.replication_id, "Canceling replication");
        shared.set_phase(ReplicationPhase::Canceled);

        let mut rt = self.inner.runtime.lock().await;
        rt.push_trigger = None;
        rt.pull_trigger = None;
        let tasks = std::mem::take(&mut rt.tasks);

        let drain_timeout = self.inner.config.drain_timeout_duration();
        let deadline = tokio::time::Instant::now() + drain_timeout;
        for (i, handle) in tasks.into_iter().enumerate() {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task failed during cancel"),
                Err(_) => {
                    warn!(task = i + 1, timeout = ?drain_timeout, "Task did not drain in time, aborting");
                    abort.abort();
                }
            }
        }

        if rt.owns_store {
            if let Some(store) = rt.store.take() {
                store.close().await;
            }
        }
        shared.activity.send_replace(Activity::default());
        metrics::set_replication_active(&shared.replication_id, false);
        info!(replication_id = %shared.replication_id, "Replication canceled");
    }

    /// Resolve once both directions finished their first run.
    ///
    /// A direction without a handler counts as done. Returns
    /// [`ReplicationError::Canceled`] if canceled first.
    pub async fn await_initial_replication(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let mut first_sync = shared.first_sync.subscribe();
        let mut canceled = shared.canceled.subscribe();

        loop {
            if first_sync.borrow_and_update().is_done() {
                return Ok(());
            }
            if *canceled.borrow_and_update() {
                return Err(ReplicationError::Canceled);
            }
            tokio::select! {
                changed = first_sync.changed() => changed.map_err(|_| ReplicationError::Canceled)?,
                changed = canceled.changed() => changed.map_err(|_| ReplicationError::Canceled)?,
            }
        }
    }

    /// Resolve once initial replication is done, nothing is queued, both
    /// engines are idle and none is retrying.
    pub async fn await_in_sync(&self) -> Result<()> {
        self.await_initial_replication().await?;

        let shared = &self.inner.shared;
        let mut pending = shared.pending.subscribe();
        let mut activity = shared.activity.subscribe();
        let mut failures = shared.failures.subscribe();
        let mut canceled = shared.canceled.subscribe();

        loop {
            let idle = *pending.borrow_and_update() == 0
                && activity.borrow_and_update().is_idle()
                && !failures.borrow_and_update().any();
            if idle {
                return Ok(());
            }
            if *canceled.borrow_and_update() {
                return Err(ReplicationError::Canceled);
            }
            let changed = tokio::select! {
                c = pending.changed() => c,
                c = activity.changed() => c,
                c = failures.changed() => c,
                c = canceled.changed() => c,
            };
            changed.map_err(|_| ReplicationError::Canceled)?;
        }
    }

    /// Queue a cycle of both engines, live or not.
    pub async fn re_sync(&self) {
        let rt = self.inner.runtime.lock().await;
        if rt.push_trigger.is_none() && rt.pull_trigger.is_none() {
            debug!(replication_id = %self.replication_identifier(), "re_sync() ignored, not running");
            return;
        }
        for trigger in rt.push_trigger.iter().chain(rt.pull_trigger.iter()) {
            trigger.fire(TriggerReason::ReSync);
        }
    }

    /// Stop starting new cycles. Queued triggers are kept.
    pub fn pause(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let mut actual = ReplicationPhase::Created;
        shared.phase.send_if_modified(|p| {
            actual = *p;
            match *p {
                ReplicationPhase::Running | ReplicationPhase::Retrying => {
                    *p = ReplicationPhase::Paused;
                    true
                }
                _ => false,
            }
        });
        match actual {
            ReplicationPhase::Running | ReplicationPhase::Retrying | ReplicationPhase::Paused => {
                shared.paused.send_replace(true);
                metrics::set_replication_phase(&shared.replication_id, "Paused");
                info!(replication_id = %shared.replication_id, "Replication paused");
                Ok(())
            }
            other => Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Undo [`pause`](Self::pause).
    pub fn resume(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let failing = shared.failures.borrow().any();
        let mut actual = ReplicationPhase::Created;
        shared.phase.send_if_modified(|p| {
            actual = *p;
            if *p != ReplicationPhase::Paused {
                return false;
            }
            *p = if failing {
                ReplicationPhase::Retrying
            } else {
                ReplicationPhase::Running
            };
            true
        });
        match actual {
            ReplicationPhase::Paused => {
                shared.paused.send_replace(false);
                metrics::set_replication_phase(&shared.replication_id, &self.phase().to_string());
                info!(replication_id = %shared.replication_id, "Replication resumed");
                Ok(())
            }
            ReplicationPhase::Running | ReplicationPhase::Retrying => Ok(()),
            other => Err(ReplicationError::InvalidState {
                expected: "Paused".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Whether two handles control the same replication.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationState")
            .field("replication_identifier", &self.replication_identifier())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

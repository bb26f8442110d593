// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live stream coordination.
//!
//! Every direction is owned by one [`EngineDriver`] task consuming an
//! unbounded trigger queue. Listeners turn change notifications into
//! triggers:
//!
//! ```text
//! fork change stream ──(skip PullApply echoes)──▶ push trigger ──▶ EngineDriver(up)
//! master stream (Change | Resync) ──────────────▶ pull trigger ──▶ EngineDriver(down)
//! live_interval tick ───────────────────────────▶ pull trigger
//! re_sync() ────────────────────────────────────▶ both triggers
//! ```
//!
//! # Debounce
//!
//! On the first trigger the driver sleeps for the debounce window, drains
//! everything queued meanwhile and runs the engine once. Runs of one
//! engine are therefore serialized and bursts coalesce; push and pull run
//! concurrently with each other.
//!
//! # Retry
//!
//! A failed cycle is logged, counted and broadcast on the error channel,
//! then retried after an exponential backoff sleep that `cancel()`
//! interrupts. Triggers arriving during the sleep are folded into the
//! retry. One successful cycle resets the backoff.

use crate::coordinator::{CycleReport, Shared};
use crate::document::Direction;
use crate::handler::{MasterEvent, MasterStream};
use crate::metrics;
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::resilience::{Backoff, RetryConfig};
use crate::storage::{BoxFuture, ChangeEvent};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why an engine run was requested (for logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// First cycle after `start()`.
    Initial,
    /// Application write on the fork.
    LocalWrite,
    /// Master stream reported a change.
    MasterChange,
    /// Master stream asked for a full resync.
    MasterResync,
    /// `live_interval` elapsed.
    Interval,
    /// Host called `re_sync()`.
    ReSync,
}

/// One engine run to exhaustion, as seen by its driver.
pub(crate) trait CycleRunner: Send + Sync + 'static {
    fn direction(&self) -> Direction;
    fn run_cycle(&self) -> BoxFuture<'_, CycleReport>;
}

impl CycleRunner for PushEngine {
    fn direction(&self) -> Direction {
        Direction::Up
    }

    fn run_cycle(&self) -> BoxFuture<'_, CycleReport> {
        Box::pin(self.push_once())
    }
}

impl CycleRunner for PullEngine {
    fn direction(&self) -> Direction {
        Direction::Down
    }

    fn run_cycle(&self) -> BoxFuture<'_, CycleReport> {
        Box::pin(self.pull_once())
    }
}

/// Sending half of a driver's trigger queue.
///
/// Every fired trigger is counted in the shared pending counter until the
/// cycle that consumed it succeeded.
#[derive(Clone)]
pub(crate) struct Trigger {
    direction: Direction,
    tx: mpsc::UnboundedSender<TriggerReason>,
    shared: Arc<Shared>,
}

impl Trigger {
    pub(crate) fn new(direction: Direction, shared: Arc<Shared>) -> (Self, mpsc::UnboundedReceiver<TriggerReason>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { direction, tx, shared }, rx)
    }

    /// Enqueue a run. Returns `false` once the driver is gone.
    pub(crate) fn fire(&self, reason: TriggerReason) -> bool {
        self.shared.pending.send_modify(|n| *n += 1);
        if self.tx.send(reason).is_err() {
            self.shared.pending.send_modify(|n| *n = n.saturating_sub(1));
            return false;
        }
        debug!(direction = %self.direction, ?reason, "Trigger queued");
        true
    }
}

/// Resolves once the canceled flag is set (or its sender is gone).
pub(crate) async fn wait_canceled(canceled: &mut watch::Receiver<bool>) {
    loop {
        if *canceled.borrow_and_update() {
            return;
        }
        if canceled.changed().await.is_err() {
            return;
        }
    }
}

/// Trigger push on application writes to the fork.
pub(crate) fn spawn_fork_listener(mut changes: broadcast::Receiver<ChangeEvent>, trigger: Trigger) -> JoinHandle<()> {
    let mut canceled = trigger.shared.canceled.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = wait_canceled(&mut canceled) => break,
                event = changes.recv() => match event {
                    // Pull writes already mirror master
                    Ok(event) if event.context.is_pull_echo() => {}
                    Ok(_) => {
                        trigger.fire(TriggerReason::LocalWrite);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fork change stream lagged");
                        trigger.fire(TriggerReason::LocalWrite);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Fork change stream closed");
                        break;
                    }
                },
            }
        }
        debug!("Fork change listener stopped");
    })
}

/// Trigger pull on master stream events.
pub(crate) fn spawn_master_listener(mut stream: MasterStream, trigger: Trigger) -> JoinHandle<()> {
    let mut canceled = trigger.shared.canceled.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = wait_canceled(&mut canceled) => break,
                event = stream.next() => match event {
                    Some(MasterEvent::Change(batch)) => {
                        debug!(documents = batch.documents.len(), "Master change");
                        trigger.fire(TriggerReason::MasterChange);
                    }
                    Some(MasterEvent::Resync) => {
                        info!("Master requested resync");
                        trigger.fire(TriggerReason::MasterResync);
                    }
                    None => {
                        warn!("Master stream ended");
                        break;
                    }
                },
            }
        }
        debug!("Master stream listener stopped");
    })
}

/// Trigger pull every `period`.
pub(crate) fn spawn_interval(period: Duration, trigger: Trigger) -> JoinHandle<()> {
    let mut canceled = trigger.shared.canceled.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; the initial cycle covers it.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = wait_canceled(&mut canceled) => break,
                _ = ticker.tick() => {
                    trigger.fire(TriggerReason::Interval);
                }
            }
        }
        debug!("Resync interval stopped");
    })
}

/// Serializes runs of one engine.
pub(crate) struct EngineDriver {
    runner: Arc<dyn CycleRunner>,
    triggers: mpsc::UnboundedReceiver<TriggerReason>,
    shared: Arc<Shared>,
    debounce: Duration,
    backoff: Backoff,
}

impl EngineDriver {
    pub(crate) fn new(
        runner: Arc<dyn CycleRunner>,
        triggers: mpsc::UnboundedReceiver<TriggerReason>,
        shared: Arc<Shared>,
        debounce: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            runner,
            triggers,
            shared,
            debounce,
            backoff: Backoff::new(retry),
        }
    }

    /// Run until canceled or every trigger sender is dropped.
    pub(crate) async fn run(mut self) {
        let direction = self.runner.direction();
        let mut canceled = self.shared.canceled.subscribe();
        info!(%direction, "Engine driver started");

        loop {
            let first = tokio::select! {
                biased;
                _ = wait_canceled(&mut canceled) => break,
                reason = self.triggers.recv() => match reason {
                    Some(reason) => reason,
                    None => break,
                },
            };

            if !self.debounce.is_zero() {
                tokio::select! {
                    biased;
                    _ = wait_canceled(&mut canceled) => break,
                    _ = tokio::time::sleep(self.debounce) => {}
                }
            }
            let mut consumed = 1 + self.drain();
            metrics::record_live_triggers(&self.shared.replication_id, direction, consumed);
            debug!(%direction, reason = ?first, coalesced = consumed, "Starting cycle");

            if !self.run_until_success(&mut canceled, &mut consumed).await {
                break;
            }
            self.shared.pending.send_modify(|n| *n = n.saturating_sub(consumed));
        }

        info!(%direction, "Engine driver stopped");
    }

    /// Take every queued trigger; they are served by the upcoming run.
    fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.triggers.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Run the engine, retrying with backoff. Returns `false` if canceled.
    async fn run_until_success(&mut self, canceled: &mut watch::Receiver<bool>, consumed: &mut usize) -> bool {
        let direction = self.runner.direction();
        let replication_id = self.shared.replication_id.clone();

        loop {
            if !self.wait_unpaused(canceled).await {
                return false;
            }

            self.shared.set_active(direction, true);
            let result = self.runner.run_cycle().await;
            self.shared.set_active(direction, false);

            match result {
                Ok(report) => {
                    let failures = self.backoff.consecutive_failures();
                    if failures > 0 {
                        info!(%direction, failures, "Cycle succeeded after retries");
                    }
                    self.backoff.reset();
                    metrics::clear_backoff(&replication_id, direction);
                    self.shared.set_failures(direction, 0);

                    if report.canceled {
                        return false;
                    }
                    debug!(
                        %direction,
                        batches = report.batches,
                        documents = report.documents,
                        skipped = report.skipped,
                        conflicts = report.conflicts,
                        "Cycle complete"
                    );
                    self.shared.mark_first_sync(direction);
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    let attempt = self.backoff.consecutive_failures();
                    if e.is_retryable() {
                        warn!(%direction, error = %e, attempt, retry_in = ?delay, "Cycle failed, retrying");
                    } else {
                        error!(%direction, error = %e, attempt, retry_in = ?delay, "Cycle failed, retrying");
                    }
                    metrics::record_error(&replication_id, direction, e.kind());
                    metrics::record_retry(&replication_id, direction, delay);
                    self.shared.set_failures(direction, attempt);
                    self.shared.events.emit_error(e);

                    tokio::select! {
                        biased;
                        _ = wait_canceled(canceled) => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    *consumed += self.drain();
                }
            }
        }
    }

    /// Block while paused. Returns `false` if canceled meanwhile.
    async fn wait_unpaused(&self, canceled: &mut watch::Receiver<bool>) -> bool {
        let mut paused = self.shared.paused.subscribe();
        loop {
            if *canceled.borrow() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                biased;
                _ = wait_canceled(canceled) => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

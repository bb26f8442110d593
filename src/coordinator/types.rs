//! Replication state types.
//!
//! Defines the state machine for the replication lifecycle and the event
//! channels engines publish on.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │                              │ (initial cycles done)
//!    │                              ↓
//!    │         pause()          Running ←──────────────┐
//!    │   Paused ←────────────────── │                  │
//!    │      │ ───────────────────→  │  (cycle failed)  │ (cycle ok)
//!    │         resume()             ↓                  │
//!    │                          Retrying ──────────────┘
//!    │                              │
//!    └──────────────────────────────┴─────→ Canceled (terminal, from any)
//!                    cancel()
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: After construction. Nothing subscribed, no checkpoint store open.
//! - **Starting**: `start()` called, opening the checkpoint store and running the first cycles.
//! - **Running**: Live replication. Engine drivers wait for triggers.
//! - **Paused**: Drivers do not start new cycles; triggers stay queued.
//! - **Retrying**: At least one engine failed its last cycle and is sleeping with backoff.
//! - **Canceled**: `cancel()` called or non-live replication finished. Terminal.

use crate::conflict::ResolvedConflict;
use crate::document::{Direction, Document};
use crate::error::ReplicationError;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each event broadcast. Slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle phase of a replication.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    /// Constructed, not started.
    ///
    /// Call [`start()`](super::ReplicationState::start) to begin replication.
    Created,

    /// Opening the checkpoint store and running initial cycles.
    Starting,

    /// Replicating.
    Running,

    /// Paused by the host.
    ///
    /// In-flight batches finish, no new cycle starts until `resume()`.
    Paused,

    /// An engine is waiting out a backoff delay.
    Retrying,

    /// Terminal.
    Canceled,
}

impl ReplicationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationPhase::Canceled)
    }
}

impl std::fmt::Display for ReplicationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationPhase::Created => write!(f, "Created"),
            ReplicationPhase::Starting => write!(f, "Starting"),
            ReplicationPhase::Running => write!(f, "Running"),
            ReplicationPhase::Paused => write!(f, "Paused"),
            ReplicationPhase::Retrying => write!(f, "Retrying"),
            ReplicationPhase::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Which engines are running a cycle right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Activity {
    pub push: bool,
    pub pull: bool,
}

impl Activity {
    pub fn is_idle(&self) -> bool {
        !self.push && !self.pull
    }

    pub(crate) fn set(&mut self, direction: Direction, active: bool) {
        match direction {
            Direction::Up => self.push = active,
            Direction::Down => self.pull = active,
        }
    }
}

/// Whether each direction has finished its first run to exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirstSync {
    pub up: bool,
    pub down: bool,
}

impl FirstSync {
    pub fn is_done(&self) -> bool {
        self.up && self.down
    }

    pub(crate) fn mark(&mut self, direction: Direction) {
        match direction {
            Direction::Up => self.up = true,
            Direction::Down => self.down = true,
        }
    }
}

/// Consecutive failed cycles per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Failures {
    pub push: usize,
    pub pull: usize,
}

impl Failures {
    pub fn any(&self) -> bool {
        self.push > 0 || self.pull > 0
    }

    pub(crate) fn set(&mut self, direction: Direction, count: usize) {
        match direction {
            Direction::Up => self.push = count,
            Direction::Down => self.pull = count,
        }
    }
}

/// Result of one engine run to exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    /// Batches committed.
    pub batches: usize,
    /// Documents acknowledged by master (push) or applied to the fork (pull).
    pub documents: usize,
    /// Documents already in sync or owned by the other direction.
    pub skipped: usize,
    /// Conflicts handed to the conflict handler.
    pub conflicts: usize,
    /// Stopped early because the replication was canceled.
    pub canceled: bool,
}

/// Event broadcasts shared by both engines and the drivers.
#[derive(Debug, Clone)]
pub struct ReplicationEvents {
    /// Documents applied to the fork by the pull engine.
    pub received: broadcast::Sender<Document>,
    /// Documents acknowledged by master.
    pub sent: broadcast::Sender<Document>,
    /// Every handled conflict. Informational, never an error.
    pub resolved_conflicts: broadcast::Sender<ResolvedConflict>,
    /// Every failed cycle, before its backoff sleep.
    pub errors: broadcast::Sender<Arc<ReplicationError>>,
}

impl ReplicationEvents {
    pub fn new() -> Self {
        Self {
            received: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            sent: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            resolved_conflicts: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            errors: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    // Sends fail only without subscribers, which is fine for events.

    pub(crate) fn emit_received(&self, doc: Document) {
        let _ = self.received.send(doc);
    }

    pub(crate) fn emit_sent(&self, doc: Document) {
        let _ = self.sent.send(doc);
    }

    pub(crate) fn emit_resolved(&self, conflict: ResolvedConflict) {
        let _ = self.resolved_conflicts.send(conflict);
    }

    pub(crate) fn emit_error(&self, error: ReplicationError) {
        let _ = self.errors.send(Arc::new(error));
    }
}

impl Default for ReplicationEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of a replication, for health endpoints.
///
/// Collected from watch channels only, no I/O.
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub replication_identifier: String,
    pub phase: ReplicationPhase,
    pub activity: Activity,
    pub first_sync: FirstSync,
    /// Triggers queued but not yet consumed, both directions.
    pub pending_triggers: usize,
    pub failures: Failures,
}

impl ReplicationStatus {
    /// Running, not retrying, initial replication done.
    pub fn healthy(&self) -> bool {
        self.phase == ReplicationPhase::Running && self.first_sync.is_done()
    }
}

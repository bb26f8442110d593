//! # Replication Protocol
//!
//! A protocol-agnostic replication core that keeps a local **fork** store
//! in sync with a remote **master**.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           ReplicationState                                  │
//! │                                                                             │
//! │  fork change stream ──▶ EngineDriver(up) ──▶ PushEngine ──▶ PushHandler ──┐  │
//! │                          (debounce, retry)       │                        │  │
//! │                                                  ▼                        ▼  │
//! │                                          ┌───────────────┐            master │
//! │                                          │CheckpointStore│                ▲  │
//! │                                          │ checkpoints + │                │  │
//! │                                          │  assumed meta │                │  │
//! │                                          │   (SQLite)    │                │  │
//! │                                          └───────────────┘                │  │
//! │                                                  ▲                        │  │
//! │  master stream ──────▶ EngineDriver(down) ─▶ PullEngine ◀── PullHandler ──┘  │
//! │                                                  │                          │
//! │                                     ConflictHandler (deterministic)         │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Resumable**: every batch commits its meta rows and checkpoint in
//!    one transaction, so a restart continues where it stopped
//! 2. **Idempotent pull**: re-applying a pulled batch is a meta-only no-op
//! 3. **Convergent**: conflicts are resolved by a deterministic handler
//!    against the state the fork assumed master had
//! 4. **Tombstones kept**: deletions replicate as `_deleted` documents
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_protocol::conflict::MasterWins;
//! use replication_protocol::handler::StorageMaster;
//! use replication_protocol::{replicate, Document, MemoryStorage, ReplicationConfig, ReplicationOptions, ReplicationRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replication_protocol::Result<()> {
//!     let fork = Arc::new(MemoryStorage::new("fork"));
//!     let master = Arc::new(StorageMaster::new(Arc::new(MemoryStorage::new("master")), Arc::new(MasterWins)));
//!
//!     let options = ReplicationOptions::new(ReplicationConfig::for_testing("todos"), fork.clone())
//!         .with_pull(master.clone())
//!         .with_push(master);
//!     let registry = ReplicationRegistry::new();
//!     let state = replicate(&registry, options).await?;
//!
//!     fork.upsert(Document::new("todo-1").with_field("title", "write docs")).await?;
//!     state.re_sync().await;
//!     state.await_in_sync().await?;
//!
//!     state.cancel().await;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod handler;
pub mod live;
pub mod metrics;
pub mod pull;
pub mod push;
pub mod registry;
pub mod resilience;
pub mod storage;

// Re-exports for convenience
pub use checkpoint::{AssumedMasterState, CheckpointStore};
pub use config::{CheckpointConfig, PullConfig, PushConfig, ReplicationConfig, RetrySettings};
pub use conflict::{ConflictHandler, ConflictInput, ConflictOutcome, MasterWins, ResolvedConflict};
pub use coordinator::{ReplicationOptions, ReplicationPhase, ReplicationState, ReplicationStatus};
pub use document::{Checkpoint, Direction, Document, Revision, StoredDocument};
pub use error::{ReplicationError, Result};
pub use handler::{MasterEvent, PullBatch, PullHandler, PushHandler, PushRow, StorageMaster};
pub use live::TriggerReason;
pub use pull::PullEngine;
pub use push::PushEngine;
pub use registry::{replicate, ReplicationRegistry};
pub use storage::{ForkStorage, MemoryStorage, WriteContext};

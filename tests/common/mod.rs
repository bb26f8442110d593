//! Shared test utilities for replication and chaos tests.
//!
//! This module provides:
//! - Recording/failing wrappers around pull and push handlers
//! - A fork storage wrapper that injects write failures
//! - Config and fixture helpers

#![allow(dead_code)]

pub mod mock_handlers;

pub use mock_handlers::*;

use replication_protocol::conflict::MasterWins;
use replication_protocol::{
    CheckpointStore, MemoryStorage, ReplicationConfig, ReplicationOptions, StorageMaster,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A storage-backed master with master-wins conflict rules.
pub fn master() -> Arc<StorageMaster<MemoryStorage>> {
    Arc::new(StorageMaster::new(
        Arc::new(MemoryStorage::new("master")),
        Arc::new(MasterWins),
    ))
}

/// Fast, in-memory, live config.
pub fn live_config(id: &str) -> ReplicationConfig {
    ReplicationConfig::for_testing(id)
}

/// Fast, in-memory config that cancels itself after the initial replication.
pub fn one_shot_config(id: &str) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(id);
    config.live = false;
    config
}

pub async fn memory_store() -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::in_memory().await.expect("in-memory checkpoint store"))
}

/// Options replicating `fork` against `master` in both directions.
pub fn both_ways(
    config: ReplicationConfig,
    fork: Arc<MemoryStorage>,
    master: Arc<StorageMaster<MemoryStorage>>,
) -> ReplicationOptions {
    ReplicationOptions::new(config, fork)
        .with_pull(master.clone())
        .with_push(master)
}

/// Poll `check` every 10ms until it holds, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

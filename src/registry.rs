//! Process-wide bookkeeping of running replications.
//!
//! At most one live replication per identifier: two replications writing
//! the same checkpoint and meta rows would corrupt each other's view of
//! master. Canceled replications free their identifier.

use crate::coordinator::{ReplicationOptions, ReplicationState};
use crate::error::{ReplicationError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Replications keyed by identifier. Cheap to clone.
#[derive(Clone, Default)]
pub struct ReplicationRegistry {
    replications: Arc<DashMap<String, ReplicationState>>,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replication under its identifier.
    ///
    /// Fails with [`ReplicationError::DuplicateReplication`] while another
    /// replication with that identifier is not canceled.
    pub fn register(&self, state: ReplicationState) -> Result<()> {
        let id = state.replication_identifier().to_string();
        match self.replications.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().ptr_eq(&state) {
                    return Ok(());
                }
                if !existing.get().is_canceled() {
                    warn!(replication_id = %id, "Rejected duplicate replication");
                    return Err(ReplicationError::DuplicateReplication(id));
                }
                existing.insert(state);
            }
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
        Ok(())
    }

    /// The running replication for an identifier.
    pub fn get(&self, replication_id: &str) -> Option<ReplicationState> {
        self.replications
            .get(replication_id)
            .map(|r| r.value().clone())
            .filter(|state| !state.is_canceled())
    }

    /// Forget a replication (does not cancel it).
    pub fn remove(&self, replication_id: &str) -> Option<ReplicationState> {
        self.replications.remove(replication_id).map(|(_, state)| state)
    }

    /// Identifiers of replications that are not canceled.
    pub fn ids(&self) -> Vec<String> {
        self.replications
            .iter()
            .filter(|r| !r.value().is_canceled())
            .map(|r| r.key().clone())
            .collect()
    }

    /// Drop canceled replications. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.replications.len();
        self.replications.retain(|_, state| !state.is_canceled());
        before - self.replications.len()
    }

    pub fn len(&self) -> usize {
        self.replications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replications.is_empty()
    }

    /// Cancel every registered replication and clear the registry.
    pub async fn cancel_all(&self) {
        let states: Vec<ReplicationState> = self.replications.iter().map(|r| r.value().clone()).collect();
        self.replications.clear();
        for state in states {
            state.cancel().await;
        }
        info!("All replications canceled");
    }
}

impl std::fmt::Debug for ReplicationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationRegistry")
            .field("replications", &self.replications.len())
            .finish()
    }
}

/// Build a replication, register it and start it if `auto_start` is set.
///
/// ```rust,no_run
/// use replication_protocol::{replicate, MemoryStorage, ReplicationConfig, ReplicationOptions, ReplicationRegistry};
/// use replication_protocol::handler::StorageMaster;
/// use replication_protocol::conflict::MasterWins;
/// use std::sync::Arc;
///
/// # async fn run() -> replication_protocol::Result<()> {
/// let registry = ReplicationRegistry::new();
/// let master = Arc::new(StorageMaster::new(Arc::new(MemoryStorage::new("master")), Arc::new(MasterWins)));
/// let options = ReplicationOptions::new(ReplicationConfig::for_testing("todos"), Arc::new(MemoryStorage::new("fork")))
///     .with_pull(master.clone())
///     .with_push(master);
///
/// let state = replicate(&registry, options).await?;
/// state.await_initial_replication().await?;
/// state.cancel().await;
/// # Ok(())
/// # }
/// ```
pub async fn replicate(registry: &ReplicationRegistry, options: ReplicationOptions) -> Result<ReplicationState> {
    let state = ReplicationState::new(options)?;
    registry.register(state.clone())?;

    if state.config().auto_start {
        if let Err(e) = state.start().await {
            registry
                .replications
                .remove_if(state.replication_identifier(), |_, registered| registered.ptr_eq(&state));
            return Err(e);
        }
    }
    Ok(state)
}

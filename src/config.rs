//! Configuration for a replication.
//!
//! Configuration is passed to [`ReplicationState::new()`](crate::ReplicationState::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_protocol::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     replication_identifier: "todos-to-server".into(),
//!     live: true,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── replication_identifier: String  # Scopes checkpoints + meta
//! ├── live: bool                      # Keep syncing after initial replication
//! ├── auto_start: bool                # replicate() starts immediately
//! ├── retry: RetrySettings            # Backoff after handler errors
//! ├── push: PushConfig                # Fork → master batches
//! ├── pull: PullConfig                # Master → fork batches
//! ├── checkpoint: CheckpointConfig    # SQLite checkpoint persistence
//! └── drain_timeout: String           # How long cancel() waits for in-flight batches
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! replication_identifier: "todos-to-server"
//! live: true
//!
//! retry:
//!   retry_time: "5s"
//!   max_retry_time: "5m"
//!
//! push:
//!   batch_size: 50
//!   debounce: "20ms"
//!
//! pull:
//!   batch_size: 100
//!   live_interval: "10s"
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/app/replication.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationState::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Stable key for this replication. Checkpoints and assumed-master
    /// states are stored under it, so it must survive restarts unchanged.
    pub replication_identifier: String,

    /// Keep replicating after the initial sync.
    /// When `false` the replication cancels itself once in sync.
    #[serde(default = "default_true")]
    pub live: bool,

    /// Start immediately when built through [`replicate()`](crate::replicate).
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Backoff after engine errors.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Push (fork → master) settings.
    #[serde(default)]
    pub push: PushConfig,

    /// Pull (master → fork) settings.
    #[serde(default)]
    pub pull: PullConfig,

    /// Checkpoint persistence settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Upper bound `cancel()` waits for an in-flight batch (e.g., "10s").
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_identifier: "default-replication".to_string(),
            live: true,
            auto_start: true,
            retry: RetrySettings::default(),
            push: PushConfig::default(),
            pull: PullConfig::default(),
            checkpoint: CheckpointConfig::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReplicationConfig {
    /// Create a config for testing: in-memory checkpoints, fast retries,
    /// short debounce.
    pub fn for_testing(replication_identifier: &str) -> Self {
        Self {
            replication_identifier: replication_identifier.to_string(),
            live: true,
            auto_start: true,
            retry: RetrySettings::testing(),
            push: PushConfig {
                debounce: "10ms".to_string(),
                ..Default::default()
            },
            pull: PullConfig {
                debounce: "10ms".to_string(),
                ..Default::default()
            },
            checkpoint: CheckpointConfig::in_memory(),
            drain_timeout: "2s".to_string(),
        }
    }

    /// Parsed drain timeout (falls back to 10s).
    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(10))
    }

    /// Reject configurations the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.replication_identifier.trim().is_empty() {
            return Err(ReplicationError::Config(
                "replication_identifier must not be empty".to_string(),
            ));
        }
        if self.push.batch_size == 0 {
            return Err(ReplicationError::Config("push.batch_size must be > 0".to_string()));
        }
        if self.pull.batch_size == 0 {
            return Err(ReplicationError::Config("pull.batch_size must be > 0".to_string()));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(ReplicationError::Config(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: backoff after errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff settings applied per engine after a failed cycle.
///
/// The first retry waits `retry_time`; every consecutive failure multiplies
/// the delay by `backoff_factor` until `max_retry_time`. One fully
/// successful cycle resets the delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Base delay as a duration string (e.g., "5s").
    #[serde(default = "default_retry_time")]
    pub retry_time: String,

    /// Delay cap as a duration string (e.g., "5m").
    #[serde(default = "default_max_retry_time")]
    pub max_retry_time: String,

    /// Multiplier between consecutive failures.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_retry_time() -> String {
    "5s".to_string()
}

fn default_max_retry_time() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_time: default_retry_time(),
            max_retry_time: default_max_retry_time(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetrySettings {
    /// Millisecond-scale retries for tests.
    pub fn testing() -> Self {
        Self {
            retry_time: "10ms".to_string(),
            max_retry_time: "100ms".to_string(),
            backoff_factor: 2.0,
        }
    }

    pub fn retry_time_duration(&self) -> Duration {
        parse_duration_or(&self.retry_time, Duration::from_secs(5))
    }

    pub fn max_retry_time_duration(&self) -> Duration {
        parse_duration_or(&self.max_retry_time, Duration::from_secs(300))
    }

    /// Build the backoff schedule used by the engine drivers.
    pub fn to_retry_config(&self) -> RetryConfig {
        let initial_delay = self.retry_time_duration();
        RetryConfig {
            initial_delay,
            max_delay: self.max_retry_time_duration().max(initial_delay),
            backoff_factor: self.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PushConfig / PullConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Push (fork → master) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Whether pushing is enabled (requires a push handler).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum rows per push handler call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Window during which local writes are coalesced into one push.
    #[serde(default = "default_debounce")]
    pub debounce: String,

    /// Enable rate limiting of push handler calls.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained handler calls per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst capacity.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_debounce() -> String {
    "50ms".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            debounce: default_debounce(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl PushConfig {
    pub fn debounce_duration(&self) -> Duration {
        parse_duration_or(&self.debounce, Duration::from_millis(50))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

/// Pull (master → fork) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Whether pulling is enabled (requires a pull handler).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum documents requested per pull handler call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Window during which master events are coalesced into one pull.
    #[serde(default = "default_debounce")]
    pub debounce: String,

    /// Periodic resync in live mode (e.g., "10s"). Useful when the master
    /// has no change stream. Disabled when unset.
    #[serde(default)]
    pub live_interval: Option<String>,

    /// Enable rate limiting of pull handler calls.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained handler calls per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst capacity.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            debounce: default_debounce(),
            live_interval: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl PullConfig {
    pub fn debounce_duration(&self) -> Duration {
        parse_duration_or(&self.debounce, Duration::from_millis(50))
    }

    /// Parsed periodic resync interval. Unparseable values disable it.
    pub fn live_interval_duration(&self) -> Option<Duration> {
        self.live_interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .filter(|d| !d.is_zero())
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database (":memory:" for an in-process store).
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_checkpoints.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    /// In-memory store (for testing).
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

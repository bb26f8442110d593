//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Documents pulled/pushed per replication
//! - Conflicts and how they were resolved
//! - Handler latency and failures
//! - Retry/backoff behavior
//! - Checkpoint persistence
//! - Lifecycle phase
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is exported unless the host installs a `metrics` recorder.
//!
//! # Usage
//!
//! ```rust,no_run
//! use replication_protocol::metrics;
//! use replication_protocol::Direction;
//! use std::time::Duration;
//!
//! metrics::record_documents_pulled("todos", 42);
//! metrics::record_handler_call("todos", Direction::Up, Duration::from_millis(80), true);
//! ```

use crate::document::Direction;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record documents applied to the fork by the pull engine.
pub fn record_documents_pulled(replication_id: &str, count: usize) {
    counter!("replication_documents_pulled_total", "replication_id" => replication_id.to_string())
        .increment(count as u64);
}

/// Record documents acknowledged by the master.
pub fn record_documents_pushed(replication_id: &str, count: usize) {
    counter!("replication_documents_pushed_total", "replication_id" => replication_id.to_string())
        .increment(count as u64);
}

/// Record documents skipped by an engine (already in sync, pending resolution, CAS race).
pub fn record_documents_skipped(replication_id: &str, direction: Direction, reason: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "replication_documents_skipped_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str(),
        "reason" => reason
    )
    .increment(count as u64);
}

/// Record a conflict and its outcome ("equal" or "resolved").
pub fn record_conflict(replication_id: &str, direction: Direction, outcome: &'static str) {
    counter!(
        "replication_conflicts_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a pull/push handler call.
pub fn record_handler_call(replication_id: &str, direction: Direction, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_handler_calls_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "replication_handler_duration_seconds",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a completed engine cycle (run to exhaustion).
pub fn record_cycle(replication_id: &str, direction: Direction, batches: usize, duration: Duration) {
    counter!(
        "replication_cycles_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .increment(1);
    counter!(
        "replication_batches_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .increment(batches as u64);
    histogram!(
        "replication_cycle_duration_seconds",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record an engine error.
pub fn record_error(replication_id: &str, direction: Direction, error_kind: &'static str) {
    counter!(
        "replication_errors_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str(),
        "error_type" => error_kind
    )
    .increment(1);
}

/// Record a retry with its backoff delay.
pub fn record_retry(replication_id: &str, direction: Direction, delay: Duration) {
    counter!(
        "replication_retries_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .increment(1);
    gauge!(
        "replication_backoff_seconds",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .set(delay.as_secs_f64());
}

/// Clear the backoff gauge after a successful cycle.
pub fn clear_backoff(replication_id: &str, direction: Direction) {
    gauge!(
        "replication_backoff_seconds",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .set(0.0);
}

/// Record live triggers and how many were coalesced into one run.
pub fn record_live_triggers(replication_id: &str, direction: Direction, received: usize) {
    counter!(
        "replication_live_triggers_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction.as_str()
    )
    .increment(received as u64);
    if received > 1 {
        counter!(
            "replication_live_triggers_coalesced_total",
            "replication_id" => replication_id.to_string(),
            "direction" => direction.as_str()
        )
        .increment((received - 1) as u64);
    }
}

/// Record a checkpoint commit (meta rows + checkpoint in one transaction).
pub fn record_checkpoint_commit(replication_id: &str, direction: Option<Direction>, meta_rows: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    let direction = direction.map_or("none", |d| d.as_str());
    counter!(
        "replication_checkpoint_commits_total",
        "replication_id" => replication_id.to_string(),
        "direction" => direction,
        "status" => status
    )
    .increment(1);
    if success {
        counter!("replication_meta_rows_written_total", "replication_id" => replication_id.to_string())
            .increment(meta_rows as u64);
    }
}

/// SQLite busy/locked retries in the checkpoint store.
pub fn checkpoint_store_retries_total(operation: &str) {
    counter!("replication_checkpoint_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Whether either engine of a replication is currently running a cycle.
pub fn set_replication_active(replication_id: &str, active: bool) {
    gauge!("replication_active", "replication_id" => replication_id.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

/// Gauge for lifecycle phase.
pub fn set_replication_phase(replication_id: &str, phase: &str) {
    // Encode phase as numeric for alerting
    let value = match phase {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Paused" => 3.0,
        "Retrying" => 4.0,
        "Canceled" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_phase", "replication_id" => replication_id.to_string()).set(value);
}

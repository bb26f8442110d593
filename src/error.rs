// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! Errors are categorized by their source (pull/push handler, local storage,
//! checkpoint store, conflict handler) and include context to help with
//! debugging. Conflicts are **not** errors: they are resolved by the
//! [`ConflictHandler`](crate::conflict::ConflictHandler) and surfaced as
//! informational events only.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `PullHandler` | Yes | Remote pull failed (network, timeout, 5xx) |
//! | `PushHandler` | Yes | Remote push failed (network, timeout, 5xx) |
//! | `ConflictHandler` | Yes | Resolver failed; the triggering batch is retried |
//! | `Storage` | Yes | Local fork storage rejected a non-conflict write |
//! | `MalformedResponse` | No | Handler returned data that cannot be applied |
//! | `CheckpointStore` | No | Local SQLite errors (needs operator attention) |
//! | `Serialization` | No | Stored meta/checkpoint could not be (de)serialized |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `DuplicateReplication` | No | Identifier already running in this registry |
//! | `Canceled` | No | Replication was canceled |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Every error raised inside an engine cycle is retried by the engine driver
//! with backoff, since the checkpoint never advanced past it. Use
//! [`ReplicationError::is_retryable()`] to tell transient failures (logged at
//! `warn`) apart from ones that will keep failing until the root cause is
//! fixed (logged at `error`).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The pull handler failed to deliver a batch.
    #[error("Pull handler error: {message}")]
    PullHandler {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The push handler failed to accept a batch.
    #[error("Push handler error: {message}")]
    PushHandler {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The conflict handler failed for a document.
    ///
    /// The whole batch is retried after backoff; the item is never dropped.
    #[error("Conflict handler error ({document_id}): {message}")]
    ConflictHandler { document_id: String, message: String },

    /// Local fork storage failure (anything but a revision mismatch).
    #[error("Storage error ({operation}): {message}")]
    Storage { operation: String, message: String },

    /// A handler returned data that cannot be applied.
    ///
    /// The batch is abandoned for this cycle and retried identically next
    /// cycle because the checkpoint did not move.
    #[error("Malformed response from {origin}: {message}")]
    MalformedResponse { origin: String, message: String },

    /// SQLite error during checkpoint/meta persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Stored JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong phase
    /// (e.g., calling `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Another replication with the same identifier is already registered.
    #[error("Replication already running for identifier {0}")]
    DuplicateReplication(String),

    /// The replication was canceled.
    #[error("Replication canceled")]
    Canceled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a pull handler error from any error source.
    pub fn pull<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::PullHandler {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a pull handler error without source
    pub fn pull_msg(message: impl Into<String>) -> Self {
        Self::PullHandler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a push handler error from any error source.
    pub fn push<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::PushHandler {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a push handler error without source
    pub fn push_msg(message: impl Into<String>) -> Self {
        Self::PushHandler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-response error
    pub fn malformed(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PullHandler { .. } => true, // Network errors are retryable
            Self::PushHandler { .. } => true,
            Self::ConflictHandler { .. } => true,
            Self::Storage { .. } => true,
            Self::MalformedResponse { .. } => false, // Caller must fix the source
            Self::CheckpointStore(_) => false,       // Local DB issues need attention
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::DuplicateReplication(_) => false,
            Self::Canceled => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PullHandler { .. } => "pull_handler",
            Self::PushHandler { .. } => "push_handler",
            Self::ConflictHandler { .. } => "conflict_handler",
            Self::Storage { .. } => "storage",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::CheckpointStore(_) => "checkpoint_store",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::DuplicateReplication(_) => "duplicate_replication",
            Self::Canceled => "canceled",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_pull_handler() {
        let err = ReplicationError::pull_msg("connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_is_retryable_push_handler_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = ReplicationError::push(io);
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_is_retryable_conflict_handler() {
        let err = ReplicationError::ConflictHandler {
            document_id: "doc-1".to_string(),
            message: "merge failed".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("doc-1"));
    }

    #[test]
    fn test_is_retryable_storage() {
        let err = ReplicationError::storage("bulk_write", "disk full");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bulk_write"));
    }

    #[test]
    fn test_not_retryable_malformed() {
        let err = ReplicationError::malformed("pull", "document without id");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("pull"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("batch_size must be > 0".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_canceled() {
        assert!(!ReplicationError::Canceled.is_retryable());
        assert!(!ReplicationError::DuplicateReplication("x".into()).is_retryable());
        assert!(!ReplicationError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn test_serialization_from() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ReplicationError = json_err.into();
        assert_eq!(err.kind(), "serialization");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ReplicationError::pull_msg("x").kind(), "pull_handler");
        assert_eq!(ReplicationError::push_msg("x").kind(), "push_handler");
        assert_eq!(ReplicationError::Canceled.kind(), "canceled");
    }
}

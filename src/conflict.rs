//! Conflict detection and resolution contract.
//!
//! A conflict exists when the fork wrote a document based on a master
//! state ("assumed master state") that is no longer master's real state.
//! Both engines hand such cases to a [`ConflictHandler`].
//!
//! # Contract
//!
//! - `is_equal(a, b)` is pure and synchronous. Engines use it to decide
//!   whether two states have converged and no write is needed.
//! - `resolve(input)` is deterministic: the same input always yields the
//!   same outcome, so peers replicating against one master converge
//!   without coordinating. It may be async (e.g., ask the user, call a
//!   merge service).
//! - An error from `resolve` aborts the batch; the batch is retried after
//!   backoff and the document is never dropped.
//!
//! # Outcomes
//!
//! ```text
//! is_equal(new, real) ─yes─→ Equal            (no write, just meta)
//!        │no
//!        ↓
//! handler decides  ────────→ Resolved(doc)    (doc written to the fork,
//!                                              pushed on the next cycle)
//! ```
//!
//! The default [`MasterWins`] returns `real_master_state` verbatim.

use crate::document::{Direction, Document};
use crate::error::{ReplicationError, Result};
use crate::storage::BoxFuture;
use serde::{Deserialize, Serialize};

/// The three states a conflict decision is based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInput {
    /// The fork's current state.
    pub new_document_state: Document,
    /// What the fork believed master had; `None` if it never saw master's copy.
    pub assumed_master_state: Option<Document>,
    /// Master's actual current state.
    pub real_master_state: Document,
}

impl ConflictInput {
    pub fn document_id(&self) -> &str {
        &self.real_master_state.id
    }
}

/// Result of [`ConflictHandler::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "document")]
pub enum ConflictOutcome {
    /// Fork and master converged independently; nothing to write.
    Equal,
    /// Merged state to write into the fork.
    Resolved(Document),
}

/// Informational event emitted for every handled conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    /// Which engine detected it.
    pub direction: Direction,
    pub input: ConflictInput,
    pub outcome: ConflictOutcome,
}

/// Pluggable, deterministic conflict resolution.
pub trait ConflictHandler: Send + Sync + 'static {
    /// Whether two wire states are identical for replication purposes.
    ///
    /// Default implementation compares id, fields and the tombstone flag.
    fn is_equal(&self, a: &Document, b: &Document) -> bool {
        a == b
    }

    /// Decide the outcome of a conflict.
    ///
    /// `context` names the call site (`"push"` or `"pull"`) for handlers
    /// that log or branch on it.
    fn resolve<'a>(&'a self, input: &'a ConflictInput, context: &'a str) -> BoxFuture<'a, ConflictOutcome>;
}

/// Run `handler.resolve` for one of the engines.
///
/// Errors from the handler are reported as [`ReplicationError::ConflictHandler`]
/// for the document, and a resolution for a different id is rejected.
pub(crate) async fn resolve_for(
    handler: &dyn ConflictHandler,
    input: &ConflictInput,
    direction: Direction,
) -> Result<ConflictOutcome> {
    let context = match direction {
        Direction::Up => "push",
        Direction::Down => "pull",
    };
    let document_id = input.document_id();

    let outcome = handler.resolve(input, context).await.map_err(|e| match e {
        e @ ReplicationError::ConflictHandler { .. } => e,
        other => ReplicationError::ConflictHandler {
            document_id: document_id.to_string(),
            message: other.to_string(),
        },
    })?;

    if let ConflictOutcome::Resolved(doc) = &outcome {
        if doc.id != document_id {
            return Err(ReplicationError::ConflictHandler {
                document_id: document_id.to_string(),
                message: format!("resolved document has id {:?}", doc.id),
            });
        }
    }
    Ok(outcome)
}

/// Master always wins: the fork adopts master's state unless equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterWins;

impl ConflictHandler for MasterWins {
    fn resolve<'a>(&'a self, input: &'a ConflictInput, _context: &'a str) -> BoxFuture<'a, ConflictOutcome> {
        Box::pin(async move {
            if self.is_equal(&input.new_document_state, &input.real_master_state) {
                return Ok(ConflictOutcome::Equal);
            }
            Ok(ConflictOutcome::Resolved(input.real_master_state.clone()))
        })
    }
}

/// Adapter turning a synchronous merge function into a [`ConflictHandler`].
///
/// Equality is checked first, so `merge` is only called for genuinely
/// diverged states.
///
/// ```rust
/// use replication_protocol::conflict::{ConflictInput, FnConflictHandler};
/// use replication_protocol::Document;
///
/// // Highest "v" wins
/// let handler = FnConflictHandler::new(|input: &ConflictInput| {
///     let v = |d: &Document| d.get("v").and_then(|v| v.as_i64()).unwrap_or(0);
///     if v(&input.new_document_state) > v(&input.real_master_state) {
///         input.new_document_state.clone()
///     } else {
///         input.real_master_state.clone()
///     }
/// });
/// # let _ = handler;
/// ```
pub struct FnConflictHandler<F> {
    merge: F,
}

impl<F> FnConflictHandler<F>
where
    F: Fn(&ConflictInput) -> Document + Send + Sync + 'static,
{
    pub fn new(merge: F) -> Self {
        Self { merge }
    }
}

impl<F> ConflictHandler for FnConflictHandler<F>
where
    F: Fn(&ConflictInput) -> Document + Send + Sync + 'static,
{
    fn resolve<'a>(&'a self, input: &'a ConflictInput, _context: &'a str) -> BoxFuture<'a, ConflictOutcome> {
        Box::pin(async move {
            if self.is_equal(&input.new_document_state, &input.real_master_state) {
                return Ok(ConflictOutcome::Equal);
            }
            Ok(ConflictOutcome::Resolved((self.merge)(input)))
        })
    }
}

impl<F> std::fmt::Debug for FnConflictHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnConflictHandler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(new: Document, real: Document) -> ConflictInput {
        ConflictInput {
            new_document_state: new,
            assumed_master_state: None,
            real_master_state: real,
        }
    }

    #[tokio::test]
    async fn test_master_wins_equal() {
        let a = Document::new("x").with_field("v", 1);
        let outcome = MasterWins.resolve(&input(a.clone(), a), "push").await.unwrap();
        assert_eq!(outcome, ConflictOutcome::Equal);
    }

    #[tokio::test]
    async fn test_master_wins_returns_master_verbatim() {
        let fork = Document::new("x").with_field("v", 1);
        let master = Document::new("x").with_field("v", 2).with_field("extra", true);
        let outcome = MasterWins.resolve(&input(fork, master.clone()), "pull").await.unwrap();
        assert_eq!(outcome, ConflictOutcome::Resolved(master));
    }

    #[tokio::test]
    async fn test_master_wins_tombstone_is_not_equal() {
        let fork = Document::new("x");
        let master = Document::tombstone("x");
        let outcome = MasterWins.resolve(&input(fork, master.clone()), "pull").await.unwrap();
        assert_eq!(outcome, ConflictOutcome::Resolved(master));
    }

    #[tokio::test]
    async fn test_fn_handler_merges() {
        let handler = FnConflictHandler::new(|input: &ConflictInput| {
            let mut merged = input.real_master_state.clone();
            for (k, v) in &input.new_document_state.fields {
                merged.fields.entry(k.clone()).or_insert_with(|| v.clone());
            }
            merged
        });

        let fork = Document::new("x").with_field("local", 1);
        let master = Document::new("x").with_field("remote", 2);
        let outcome = handler.resolve(&input(fork, master), "push").await.unwrap();
        match outcome {
            ConflictOutcome::Resolved(doc) => {
                assert_eq!(doc.get("local"), Some(&json!(1)));
                assert_eq!(doc.get("remote"), Some(&json!(2)));
            }
            ConflictOutcome::Equal => panic!("expected a merge"),
        }
    }

    #[tokio::test]
    async fn test_fn_handler_short_circuits_equal() {
        let handler = FnConflictHandler::new(|_: &ConflictInput| panic!("merge must not run for equal states"));
        let a = Document::new("x").with_field("v", 1);
        assert_eq!(handler.resolve(&input(a.clone(), a), "push").await.unwrap(), ConflictOutcome::Equal);
    }

    struct Failing;

    impl ConflictHandler for Failing {
        fn resolve<'a>(&'a self, _input: &'a ConflictInput, _context: &'a str) -> BoxFuture<'a, ConflictOutcome> {
            Box::pin(async { Err(ReplicationError::Internal("merge service down".into())) })
        }
    }

    #[tokio::test]
    async fn test_resolve_for_wraps_handler_errors() {
        let err = resolve_for(&Failing, &input(Document::new("x"), Document::new("x")), Direction::Up)
            .await
            .unwrap_err();
        match err {
            ReplicationError::ConflictHandler { document_id, message } => {
                assert_eq!(document_id, "x");
                assert!(message.contains("merge service down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_for_rejects_foreign_id() {
        let handler = FnConflictHandler::new(|_: &ConflictInput| Document::new("other"));
        let fork = Document::new("x").with_field("v", 1);
        let master = Document::new("x").with_field("v", 2);
        let err = resolve_for(&handler, &input(fork, master), Direction::Down)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::ConflictHandler { .. }));
    }

    #[test]
    fn test_outcome_serialization() {
        let resolved = ConflictOutcome::Resolved(Document::new("x"));
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["outcome"], json!("resolved"));
        assert_eq!(json["document"]["id"], json!("x"));
        assert_eq!(serde_json::to_value(ConflictOutcome::Equal).unwrap(), json!({"outcome": "equal"}));
    }
}

//! Document and checkpoint data model.
//!
//! # Wire vs. Local State
//!
//! A [`Document`] is the unit exchanged with the master: a primary key,
//! an arbitrary JSON field set and the `_deleted` tombstone flag.
//!
//! A [`StoredDocument`] wraps it with metadata that never leaves the fork:
//!
//! ```text
//! StoredDocument
//! ├── doc: Document        # wire state (id, fields, _deleted)
//! ├── rev: Revision        # "<height>-<sha256 prefix>", bumped on every write
//! └── lwt: i64             # local write time (ms), non-decreasing per store
//! ```
//!
//! Tombstones are ordinary documents with `deleted = true`. They are kept
//! and replicated like any other state; physically removing them is a
//! cleanup policy outside of this crate.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Number of hex characters of the content hash kept in a revision.
const REVISION_HASH_LEN: usize = 16;

/// Wire state of a replicated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key.
    pub id: String,

    /// Tombstone flag.
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,

    /// All remaining fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create an empty, live document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            fields: Map::new(),
        }
    }

    /// Create a tombstone for `id`.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Hex SHA-256 over the canonical wire state.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal documents always
    /// hash equally regardless of insertion order.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([u8::from(self.deleted)]);
        hasher.update(Value::Object(self.fields.clone()).to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Revision marker: write height plus a content hash prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    /// Number of writes this document has seen in the local store.
    pub height: u64,
    /// Truncated content hash.
    pub hash: String,
}

impl Revision {
    /// Revision for the write that follows `previous`.
    pub fn next(previous: Option<&Revision>, doc: &Document) -> Self {
        let mut hash = doc.content_hash();
        hash.truncate(REVISION_HASH_LEN);
        Self {
            height: previous.map_or(1, |p| p.height + 1),
            hash,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl FromStr for Revision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (height, hash) = s
            .split_once('-')
            .ok_or_else(|| format!("revision without separator: {s}"))?;
        let height = height
            .parse::<u64>()
            .map_err(|e| format!("invalid revision height in {s}: {e}"))?;
        if hash.is_empty() {
            return Err(format!("revision without hash: {s}"));
        }
        Ok(Self {
            height,
            hash: hash.to_string(),
        })
    }
}

impl TryFrom<String> for Revision {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

/// A document as held by a local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub doc: Document,
    pub rev: Revision,
    /// Local write time in milliseconds.
    pub lwt: i64,
}

impl StoredDocument {
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    /// Position of this document in the store's `(lwt, id)` order.
    pub fn position(&self) -> ForkCheckpoint {
        ForkCheckpoint {
            id: self.doc.id.clone(),
            lwt: self.lwt,
        }
    }
}

/// Opaque replication cursor.
///
/// Its shape is defined by whichever side produced it; the core only
/// stores it and hands it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub Value);

impl Checkpoint {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Position inside a store ordered by `(lwt, id)`.
///
/// This is the checkpoint shape used by
/// [`ForkStorage::changed_since`](crate::storage::ForkStorage::changed_since).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForkCheckpoint {
    // Field order matters: derived Ord compares lwt first, then id.
    pub lwt: i64,
    pub id: String,
}

impl ForkCheckpoint {
    /// Parse from an opaque checkpoint. Returns `None` for foreign shapes.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Option<Self> {
        let obj = checkpoint.0.as_object()?;
        Some(Self {
            id: obj.get("id")?.as_str()?.to_string(),
            lwt: obj.get("lwt")?.as_i64()?,
        })
    }
}

impl From<ForkCheckpoint> for Checkpoint {
    fn from(cp: ForkCheckpoint) -> Self {
        Checkpoint(json!({ "id": cp.id, "lwt": cp.lwt }))
    }
}

/// Replication direction. Each direction owns its own checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Fork → master (push).
    Up,
    /// Master → fork (pull).
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

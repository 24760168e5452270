//! Document shapes exchanged between the replication engine and its
//! collaborators.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A document id, as assigned by the collection's schema-defined primary key.
pub type DocumentId = String;

/// Exposes the schema-defined primary key of a document payload. Required of
/// the generic `D` type parameter so the engine can address documents by id
/// without knowing anything else about their shape.
pub trait HasId {
    fn id(&self) -> DocumentId;
}

/// An opaque cursor into the local change feed.
pub type Sequence = u64;

/// Wire-format document: the user's fields plus a boolean tombstone marker.
/// No `_rev`, no `_attachments` -- this is what crosses the pull/push
/// handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithDeleted<D> {
    #[serde(flatten)]
    pub data: D,
    #[serde(rename = "_deleted")]
    pub deleted: bool,
}

impl<D> WithDeleted<D> {
    pub fn new(data: D, deleted: bool) -> Self {
        Self { data, deleted }
    }
}

/// Internal document as held by local storage: user fields plus revision,
/// tombstone flag, and attachments metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoredDoc<D> {
    pub id: DocumentId,
    #[serde(flatten)]
    pub data: D,
    #[serde(rename = "_rev")]
    pub rev: Revision,
    #[serde(rename = "_deleted")]
    pub deleted: bool,
    #[serde(rename = "_attachments", default, skip_serializing_if = "HashMap::is_empty")]
    pub attachments: HashMap<String, serde_json::Value>,
}

impl<D: Clone> LocalStoredDoc<D> {
    /// Build the wire-format document sent to a push handler: strip `_rev`
    /// and `_attachments`, keep `_deleted` (defaulting to `false`, though by
    /// construction this field is always already populated locally).
    pub fn to_wire(&self) -> WithDeleted<D> {
        WithDeleted::new(self.data.clone(), self.deleted)
    }
}

/// A revision string, `<height>-<hash>`.
///
/// `height` increases by one on every local write; `hash` is either a
/// content digest of a local write or the pull-tagged digest produced by
/// the revision tagger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    pub height: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self { height, hash: hash.into() }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl std::str::FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, hash) = s.split_once('-').ok_or(RevisionParseError)?;
        let height = height.parse().map_err(|_| RevisionParseError)?;
        Ok(Revision::new(height, hash))
    }
}

impl TryFrom<String> for Revision {
    type Error = RevisionParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Revision> for String {
    fn from(r: Revision) -> String {
        r.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionParseError;

impl fmt::Display for RevisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed revision string, expected `<height>-<hash>`")
    }
}

impl std::error::Error for RevisionParseError {}

/// A single entry from the local change feed: the current state of a
/// changed document plus the feed sequence it was observed at.
#[derive(Debug, Clone)]
pub struct PushChangeRow<D> {
    pub doc: LocalStoredDoc<D>,
    pub sequence: Sequence,
}

/// Per-identity checkpoint persisted between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<D> {
    #[serde(default)]
    pub last_push_sequence: Sequence,
    #[serde(default)]
    pub last_pull_document: Option<WithDeleted<D>>,
}

impl<D> Default for Checkpoint<D> {
    fn default() -> Self {
        Self { last_push_sequence: 0, last_pull_document: None }
    }
}

/// Result of one pull handler invocation.
#[derive(Debug, Clone)]
pub struct PullResult<D> {
    pub documents: Vec<WithDeleted<D>>,
    pub has_more_documents: bool,
}

//! Revision tagger: breaks the push/pull echo by tagging documents
//! written by a pull with a hash that a later push cycle can recognize.
//!
//! The digest mixes the replication identity into a fast content hash of the
//! document. Because the hash is content-derived and a genuine local write
//! never computes it, the one-sidedness guarantee holds: only documents that
//! actually passed through this replication's pull path can produce a
//! matching hash.

use crate::types::WithDeleted;
use md5::{Digest, Md5};
use serde::Serialize;

/// Compute the pull-tagged hash for a document about to be written locally
/// by a pull cycle. This is the hash portion only (no `<height>-` prefix);
/// the caller assembles the full [`crate::types::Revision`].
pub fn create_revision_for_pulled_document<D: Serialize>(identity: &str, doc: &WithDeleted<D>) -> String {
    let content = serde_json::to_vec(doc).expect("WithDeleted<D> must serialize to JSON");
    let mut hasher = Md5::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"|");
    hasher.update(&content);
    hex::encode(hasher.finalize())
}

/// One-sided predicate: `true` only if `rev_hash` matches what
/// [`create_revision_for_pulled_document`] would produce right now for
/// `doc`'s current content under `identity`. Never returns `true` for a
/// revision produced by an ordinary local write.
pub fn was_revision_from_pull_replication<D: Serialize>(identity: &str, rev_hash: &str, data: &D, deleted: bool) -> bool {
    let as_wire = WithDeleted::new(data, deleted);
    create_revision_for_pulled_document(identity, &as_wire) == rev_hash
}

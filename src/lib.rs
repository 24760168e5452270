//! `replicore` -- the bidirectional replication engine for an offline-first,
//! client-side document collection.
//!
//! This crate synchronizes a local collection of JSON documents with an
//! opaque remote endpoint exposed through two user-supplied async callbacks:
//! a pull handler (paginated, checkpointed fetch of remote changes) and a
//! push handler (batched delivery of local changes). It does not implement
//! schema validation, local storage, or leader election itself -- those are
//! external collaborators described by the traits in [`collection`]; this
//! crate only owns the push/pull cycle, the checkpoint bookkeeping that lets
//! it resume, and the revision tagging that stops a pulled document from
//! immediately being pushed back out (the "echo").
//!
//! The five pieces, leaves first:
//!
//! - [`checkpoint`] -- persists `(lastPushSequence, lastPullDocument)` per
//!   replication identity.
//! - [`revision`] -- tags pulled documents so a later push recognizes and
//!   skips them.
//! - [`collector`] -- the next batch of locally-changed, not-pulled-in
//!   documents to push.
//! - [`runner`] -- serializes push-then-pull cycles, retries, and the
//!   observable lifecycle.
//! - [`controller`] -- the public entry point, [`replicate_collection`].

pub mod checkpoint;
pub mod collection;
pub mod collector;
pub mod controller;
pub mod error;
pub mod revision;
pub mod runner;
pub mod types;

pub use controller::{replicate_collection, PullOptions, PushOptions, ReplicationOptions};
pub use error::{Direction, Error, Result};
pub use runner::ReplicationState;
pub use types::{Checkpoint, HasId, LocalStoredDoc, PullResult, PushChangeRow, Revision, WithDeleted};

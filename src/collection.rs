//! External collaborator contracts consumed by the replication engine.
//!
//! None of these are implemented by this crate -- schema validation, the
//! local storage instance, and the owning collection/database are explicitly
//! out of scope. This module only pins down the call shape the engine
//! relies on.

use crate::error::Result;
use crate::types::{DocumentId, LocalStoredDoc, Sequence, WithDeleted};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// One entry in the collection's local change feed.
#[derive(Debug, Clone)]
pub struct ChangeFeedEvent<D> {
    pub sequence: Sequence,
    pub doc: LocalStoredDoc<D>,
}

/// A change event on the collection's `$` stream.
///
/// `is_local` distinguishes writes made by this client instance (which
/// should never themselves re-trigger a push wakeup loop -- they already ran
/// through the normal write path that feeds the change feed the push side
/// reads) from externally observed writes, which is what the controller's
/// push wakeup subscribes to.
#[derive(Debug, Clone)]
pub struct ChangeEvent<D> {
    pub is_local: bool,
    pub doc_id: DocumentId,
    pub doc: LocalStoredDoc<D>,
}

/// The collection's append-only local change feed, addressed by an opaque
/// monotonic sequence cursor.
#[async_trait]
pub trait ChangeFeed<D>: Send + Sync {
    /// Return every change recorded strictly after `after`, oldest first.
    /// Implementations backed by a real engine may page internally; the
    /// change collector consumes the result in order regardless of how much
    /// is returned per call.
    async fn changes_since(&self, after: Sequence) -> Result<Vec<ChangeFeedEvent<D>>>;
}

/// Key-addressable bulk document store with revision-aware writes.
#[async_trait]
pub trait StorageInstance<D>: Send + Sync {
    /// Look up the current stored version of each id, if any.
    async fn find_documents_by_id(
        &self,
        ids: &[DocumentId],
        include_deleted: bool,
    ) -> Result<HashMap<DocumentId, LocalStoredDoc<D>>>;

    /// Atomically write all of `docs`, each carrying its new `_rev`. All or
    /// none become visible.
    async fn bulk_add_revisions(&self, docs: Vec<LocalStoredDoc<D>>) -> Result<()>;
}

/// The database owning the collection, exposing the cross-writer lock and
/// leadership/idle primitives the controller and runner depend on.
#[async_trait]
pub trait RxDatabase: Send + Sync {
    /// Whether this database instance participates in multi-tab/multi-process
    /// leader election.
    fn is_multi_instance(&self) -> bool;

    /// Resolve once this instance has been elected leader. A no-op on a
    /// database that is not multi-instance.
    async fn wait_for_leadership(&self);

    /// Yield until the event loop is otherwise idle.
    async fn request_idle(&self);

    /// Mutual-exclusion primitive shared by all writers in this process.
    /// Callers acquire it with `.lock().await`.
    fn write_lock(&self) -> Arc<tokio::sync::Mutex<()>>;
}

/// The collection being replicated.
#[async_trait]
pub trait RxCollection<D>: Send + Sync {
    /// The schema's primary key path, informational only to this crate.
    fn primary_path(&self) -> &str;

    /// Whether dev-mode schema validation of pulled documents is enabled.
    fn is_dev_mode(&self) -> bool;

    /// Validate a pulled document against the collection schema. Only
    /// invoked when `is_dev_mode()` is true.
    async fn validate(&self, doc: &WithDeleted<D>) -> Result<()>;

    fn storage(&self) -> Arc<dyn StorageInstance<D>>;
    fn change_feed(&self) -> Arc<dyn ChangeFeed<D>>;
    fn database(&self) -> Arc<dyn RxDatabase>;

    /// The local-documents namespace checkpoints are stashed in.
    fn local_documents(&self) -> Arc<dyn LocalDocumentsStore>;

    /// Subscribe to the collection's `$` change stream.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent<D>>;

    /// A watch channel that flips to `true` exactly once, when the
    /// collection is destroyed.
    fn destroyed_signal(&self) -> watch::Receiver<bool>;

    fn is_destroyed(&self) -> bool {
        *self.destroyed_signal().borrow()
    }
}

/// The local-documents namespace checkpoints are persisted into. A
/// thin key/value contract over opaque JSON blobs, out of scope for this
/// crate the same way the storage instance is.
#[async_trait]
pub trait LocalDocumentsStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>>;
    async fn set(&self, id: &str, value: serde_json::Value) -> Result<()>;
}

/// Outcome of one pull handler invocation.
pub use crate::types::PullResult;

/// User-supplied pull handler: given the last-seen pulled document (the
/// resume token), fetch the next page of remote changes.
#[async_trait]
pub trait PullHandler<D>: Send + Sync {
    async fn pull(
        &self,
        last_pull_document: Option<WithDeleted<D>>,
    ) -> std::result::Result<PullResult<D>, Box<dyn std::error::Error + Send + Sync>>;
}

/// User-supplied push handler: send a batch of locally changed documents.
/// A returned error marks the whole batch as failed.
#[async_trait]
pub trait PushHandler<D>: Send + Sync {
    async fn push(
        &self,
        docs: Vec<WithDeleted<D>>,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

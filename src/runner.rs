//! Cycle runner: serializes the push-then-pull cycle, coalesces
//! concurrent triggers, drives retry scheduling, and maintains the
//! `active`/`initialReplicationComplete`/`canceled` observable state.

use crate::checkpoint::CheckpointStore;
use crate::collection::{PullHandler, PushHandler, RxCollection};
use crate::collector;
use crate::error::{Direction, Error, Result};
use crate::types::{DocumentId, HasId, LocalStoredDoc, Revision, WithDeleted};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

/// Resolved push configuration: handler plus the batch size to request from
/// the change collector.
pub struct PushConfig<D> {
    pub handler: Arc<dyn PushHandler<D>>,
    pub batch_size: usize,
}

const OBSERVABLE_CHANNEL_CAPACITY: usize = 256;

/// Runtime facade for one replication channel.
///
/// Always constructed behind an `Arc` -- cycles spawn background tasks
/// (retry timers, the live loops wired up by the controller) that need to
/// outlive the call that created them, so every method that can trigger one
/// takes `self: &Arc<Self>`.
pub struct ReplicationState<D> {
    identity: String,
    collection: Arc<dyn RxCollection<D>>,
    checkpoint: CheckpointStore<D>,
    push: Option<PushConfig<D>>,
    pull: Option<Arc<dyn PullHandler<D>>>,
    live: bool,
    retry_time: Duration,

    run_lock: Mutex<()>,
    queue_count: AtomicU8,
    run_count: AtomicU64,
    error_count: AtomicU64,

    active_tx: watch::Sender<bool>,
    active_rx: watch::Receiver<bool>,
    canceled_tx: watch::Sender<bool>,
    canceled_rx: watch::Receiver<bool>,
    initial_tx: watch::Sender<bool>,
    initial_rx: watch::Receiver<bool>,

    received_tx: broadcast::Sender<WithDeleted<D>>,
    send_tx: broadcast::Sender<WithDeleted<D>>,
    error_tx: broadcast::Sender<Arc<Error>>,
}

impl<D> ReplicationState<D>
where
    D: HasId + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        identity: String,
        collection: Arc<dyn RxCollection<D>>,
        push: Option<PushConfig<D>>,
        pull: Option<Arc<dyn PullHandler<D>>>,
        live: bool,
        retry_time: Duration,
    ) -> Arc<Self> {
        let checkpoint = CheckpointStore::new(collection.local_documents(), identity.clone());
        let (active_tx, active_rx) = watch::channel(false);
        let (canceled_tx, canceled_rx) = watch::channel(false);
        let (initial_tx, initial_rx) = watch::channel(false);
        let (received_tx, _) = broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY);
        let (send_tx, _) = broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY);

        Arc::new(Self {
            identity,
            collection,
            checkpoint,
            push,
            pull,
            live,
            retry_time,
            run_lock: Mutex::new(()),
            queue_count: AtomicU8::new(0),
            run_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            active_tx,
            active_rx,
            canceled_tx,
            canceled_rx,
            initial_tx,
            initial_rx,
            received_tx,
            send_tx,
            error_tx,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identity
    }

    /// Testability hook mirroring the source's `runCount`.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Number of errors emitted on `error$` over the lifetime of the state.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> broadcast::Receiver<WithDeleted<D>> {
        self.received_tx.subscribe()
    }

    pub fn send(&self) -> broadcast::Receiver<WithDeleted<D>> {
        self.send_tx.subscribe()
    }

    pub fn error(&self) -> broadcast::Receiver<Arc<Error>> {
        self.error_tx.subscribe()
    }

    pub fn active(&self) -> watch::Receiver<bool> {
        self.active_rx.clone()
    }

    pub fn canceled(&self) -> watch::Receiver<bool> {
        self.canceled_rx.clone()
    }

    pub fn initial_replication_complete(&self) -> watch::Receiver<bool> {
        self.initial_rx.clone()
    }

    /// `isStopped()` is true iff the collection is destroyed, or the state
    /// is not live and initial replication already completed, or the state
    /// was canceled.
    pub fn is_stopped(&self) -> bool {
        self.collection.is_destroyed() || (!self.live && *self.initial_rx.borrow()) || *self.canceled_rx.borrow()
    }

    /// Idempotent: a second or later call observes the same history as the
    /// first because it is a no-op once `canceled$` is
    /// already true.
    pub async fn cancel(self: &Arc<Self>) {
        if !*self.canceled_rx.borrow() {
            let _ = self.canceled_tx.send(true);
        }
    }

    /// Resolves once `initialReplicationComplete$` first becomes `true`. If
    /// the state is canceled before that happens, resolves with an error
    /// instead of hanging forever.
    pub async fn await_initial_replication(self: &Arc<Self>) -> Result<()> {
        let mut initial_rx = self.initial_rx.clone();
        if *initial_rx.borrow() {
            return Ok(());
        }
        let mut canceled_rx = self.canceled_rx.clone();
        if *canceled_rx.borrow() {
            return Err(Error::Canceled);
        }
        loop {
            tokio::select! {
                changed = initial_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Canceled);
                    }
                    if *initial_rx.borrow() {
                        return Ok(());
                    }
                }
                changed = canceled_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Canceled);
                    }
                    if *canceled_rx.borrow() {
                        return Err(Error::Canceled);
                    }
                }
            }
        }
    }

    /// Request that a cycle execute.
    ///
    /// Concurrent callers coalesce onto at most one in-flight cycle plus one
    /// queued follower: the internal counter is capped at 3 (1 executing +
    /// 2 chained turns), matching the source's `queueCount > 2` gate. Calls
    /// arriving once that cap is hit return immediately without scheduling
    /// anything further; their effect is already covered by the chain ahead
    /// of them.
    pub async fn run(self: &Arc<Self>, retry_on_fail: bool) {
        if self.is_stopped() {
            return;
        }

        let mut current = self.queue_count.load(Ordering::SeqCst);
        loop {
            if current > 2 {
                return;
            }
            match self.queue_count.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _permit = self.run_lock.lock().await;
        self.one_cycle(retry_on_fail).await;
        self.queue_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn schedule_retry(self: &Arc<Self>) {
        let state = Arc::clone(self);
        let retry_time = self.retry_time;
        tokio::spawn(async move {
            tokio::time::sleep(retry_time).await;
            state.run(true).await;
        });
    }

    fn emit_error(&self, err: Error) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(identity = %self.identity, error = %err, "replication cycle error");
        let _ = self.error_tx.send(Arc::new(err));
    }

    /// One cycle, wrapper plus body.
    ///
    /// A failed push always skips the pull step this cycle -- push must
    /// succeed before pull runs, whether or not `retryOnFail` is set.
    /// `retryOnFail` only gates whether a retry gets scheduled. See
    /// DESIGN.md.
    async fn one_cycle(self: &Arc<Self>, retry_on_fail: bool) {
        if self.is_stopped() {
            return;
        }

        self.run_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.active_tx.send(true);

        if *self.initial_rx.borrow() {
            self.collection.database().request_idle().await;
        }

        let mut retry_scheduled = false;
        let mut push_ok = true;

        if let Some(push) = &self.push {
            push_ok = self.run_push(push).await;
            if !push_ok && retry_on_fail {
                self.schedule_retry();
                retry_scheduled = true;
            }
        }

        if push_ok && self.pull.is_some() {
            let pull_ok = self.run_pull().await;
            if !pull_ok && retry_on_fail {
                self.schedule_retry();
                retry_scheduled = true;
            }
        }

        let _ = self.active_tx.send(false);
        if retry_on_fail && !retry_scheduled && !*self.initial_rx.borrow() {
            let _ = self.initial_tx.send(true);
        }
    }

    /// Drains pushable changes. Trampolined rather than recursive: loops
    /// until a freshly-asked batch comes back with no distinct ids to push,
    /// so the push handler is never invoked with an empty batch. A failure
    /// on any pass, including a later drain pass, is treated identically to
    /// a top-level failure.
    async fn run_push(self: &Arc<Self>, push: &PushConfig<D>) -> bool {
        let feed = self.collection.change_feed();

        loop {
            let after = match self.checkpoint.get_last_push_sequence().await {
                Ok(s) => s,
                Err(e) => {
                    self.emit_error(e);
                    return false;
                }
            };

            let batch = match collector::get_changes_since_last_push_sequence(&*feed, &self.identity, after, push.batch_size).await
            {
                Ok(b) => b,
                Err(e) => {
                    self.emit_error(e);
                    return false;
                }
            };

            if batch.changed_docs.is_empty() {
                // Nothing to push, but the cursor may have advanced past
                // filtered (pull-tagged) entries; persist that regardless.
                if batch.last_sequence != after {
                    if let Err(e) = self.checkpoint.set_last_push_sequence(batch.last_sequence).await {
                        self.emit_error(e);
                        return false;
                    }
                }
                return true;
            }

            let wire_docs: Vec<WithDeleted<D>> = batch.changed_docs.values().map(|row| row.doc.to_wire()).collect();

            if let Err(e) = push.handler.push(wire_docs.clone()).await {
                self.emit_error(Error::HandlerFailed { direction: Direction::Push, source: e });
                return false;
            }

            if self.is_stopped() {
                // Honor cancellation: the handler's write already landed
                // remotely, but nothing about it is observable locally.
                return true;
            }

            for doc in wire_docs {
                let _ = self.send_tx.send(doc);
            }

            if let Err(e) = self.checkpoint.set_last_push_sequence(batch.last_sequence).await {
                self.emit_error(e);
                return false;
            }
            // Batch was non-empty: more changes may remain past it, drain further.
        }
    }

    /// Drains pullable pages. Trampolined the same way as `run_push`.
    async fn run_pull(self: &Arc<Self>) -> bool {
        let pull = match &self.pull {
            Some(p) => Arc::clone(p),
            None => {
                self.emit_error(Error::ShouldNotHappen("runPull invoked without a pull handler configured"));
                return false;
            }
        };

        loop {
            if self.is_stopped() {
                return false;
            }

            let last_pull_document = match self.checkpoint.get_last_pull_document().await {
                Ok(d) => d,
                Err(e) => {
                    self.emit_error(e);
                    return false;
                }
            };

            let result = match pull.pull(last_pull_document).await {
                Ok(r) => r,
                Err(e) => {
                    self.emit_error(Error::HandlerFailed { direction: Direction::Pull, source: e });
                    return false;
                }
            };

            if result.documents.is_empty() {
                return true;
            }

            if self.collection.is_dev_mode() {
                for doc in &result.documents {
                    if let Err(e) = self.collection.validate(doc).await {
                        self.emit_error(Error::ValidationFailed(e.to_string()));
                        return false;
                    }
                }
            }

            if self.is_stopped() {
                // Honor cancellation: the fetched page is simply dropped.
                return true;
            }

            if let Err(e) = self.handle_documents_from_remote(&result.documents).await {
                self.emit_error(e);
                return false;
            }

            if self.is_stopped() {
                // Honor cancellation: the page already landed locally, but
                // nothing about it is observable or persisted as a checkpoint.
                return true;
            }

            for doc in &result.documents {
                let _ = self.received_tx.send(doc.clone());
            }

            if let Some(last) = result.documents.last() {
                if let Err(e) = self.checkpoint.set_last_pull_document(last.clone()).await {
                    self.emit_error(e);
                    return false;
                }
            }

            if !result.has_more_documents {
                return true;
            }
            // else: more pages remain; drain further.
        }
    }

    /// Bulk-fetch existing local versions, recompute pull-tagged revisions,
    /// and apply under the database's write lock.
    async fn handle_documents_from_remote(&self, docs: &[WithDeleted<D>]) -> Result<()> {
        let ids: Vec<DocumentId> = docs.iter().map(|d| d.data.id()).collect();
        let existing = self.collection.storage().find_documents_by_id(&ids, true).await?;

        let mut tagged: Vec<LocalStoredDoc<D>> = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.data.id();
            let hash = crate::revision::create_revision_for_pulled_document(&self.identity, doc);
            let (height, attachments) = match existing.get(&id) {
                Some(existing_doc) => (existing_doc.rev.height + 1, existing_doc.attachments.clone()),
                None => (1, HashMap::new()),
            };
            tagged.push(LocalStoredDoc {
                id,
                data: doc.data.clone(),
                rev: Revision::new(height, hash),
                deleted: doc.deleted,
                attachments,
            });
        }

        let database = self.collection.database();
        let lock = database.write_lock();
        let _guard = lock.lock().await;
        self.collection.storage().bulk_add_revisions(tagged).await
    }
}

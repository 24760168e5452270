//! Replication controller: the public entry point. Constructs a
//! [`ReplicationState`], kicks off the initial cycle, and wires up the
//! liveness timer and/or the collection's change stream depending on what
//! was configured.

use crate::collection::{ChangeEvent, PullHandler, PushHandler, RxCollection};
use crate::revision::was_revision_from_pull_replication;
use crate::runner::{PushConfig, ReplicationState};
use crate::types::HasId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use typed_builder::TypedBuilder;

/// `{ handler(lastDoc) -> { documents, hasMoreDocuments } }`.
pub struct PullOptions<D> {
    pub handler: Arc<dyn PullHandler<D>>,
}

impl<D> PullOptions<D> {
    pub fn new(handler: Arc<dyn PullHandler<D>>) -> Self {
        Self { handler }
    }
}

/// `{ handler(docs) -> void; batchSize }`.
pub struct PushOptions<D> {
    pub handler: Arc<dyn PushHandler<D>>,
    pub batch_size: usize,
}

impl<D> PushOptions<D> {
    pub fn new(handler: Arc<dyn PushHandler<D>>, batch_size: usize) -> Self {
        Self { handler, batch_size }
    }
}

/// User-supplied configuration for one replication channel.
#[derive(TypedBuilder)]
pub struct ReplicationOptions<D> {
    #[builder(setter(into))]
    pub replication_identifier: String,
    pub collection: Arc<dyn RxCollection<D>>,
    #[builder(default, setter(strip_option))]
    pub pull: Option<PullOptions<D>>,
    #[builder(default, setter(strip_option))]
    pub push: Option<PushOptions<D>>,
    #[builder(default = false)]
    pub live: bool,
    #[builder(default = Duration::from_secs(10))]
    pub live_interval: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub retry_time: Duration,
    #[builder(default = true)]
    pub wait_for_leadership: bool,
}

/// Construct and start a replication channel.
///
/// If `wait_for_leadership` is set and the owning database is
/// multi-instance, this suspends until the current instance is elected
/// leader before constructing the state at all -- a
/// non-leader instance never even kicks off its initial cycle.
pub async fn replicate_collection<D>(options: ReplicationOptions<D>) -> Arc<ReplicationState<D>>
where
    D: HasId + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    if options.wait_for_leadership && options.collection.database().is_multi_instance() {
        options.collection.database().wait_for_leadership().await;
    }

    let push_config = options.push.map(|p| PushConfig { handler: p.handler, batch_size: p.batch_size });
    let pull_handler = options.pull.map(|p| p.handler);
    let push_configured = push_config.is_some();

    let state = ReplicationState::new(
        options.replication_identifier.clone(),
        Arc::clone(&options.collection),
        push_config,
        pull_handler.clone(),
        options.live,
        options.retry_time,
    );

    // Fire a non-awaited kick of the initial cycle.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.run(true).await;
        });
    }

    if options.live {
        if pull_handler.is_some() {
            spawn_liveness_timer(Arc::clone(&state), options.live_interval);
        }
        if push_configured {
            spawn_push_wakeup(Arc::clone(&state), options.replication_identifier, options.collection);
        }
    }

    state
}

/// Live-mode pull branch: wait `live_interval`, check `isStopped()`, then
/// `run(retryOnFail=false)` so stacked interval ticks cannot pile up retries
/// on top of an already-failing endpoint.
fn spawn_liveness_timer<D>(state: Arc<ReplicationState<D>>, live_interval: Duration)
where
    D: HasId + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(live_interval).await;
            if state.is_stopped() {
                break;
            }
            state.run(false).await;
        }
    });
}

/// Live-mode push branch: subscribe to the collection's change stream,
/// filtered to non-local events whose revision is not pull-tagged for this
/// identity -- otherwise a pull's own write would wake the push side right
/// back up.
fn spawn_push_wakeup<D>(state: Arc<ReplicationState<D>>, identity: String, collection: Arc<dyn RxCollection<D>>)
where
    D: HasId + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut events: broadcast::Receiver<ChangeEvent<D>> = collection.subscribe();
        loop {
            if state.is_stopped() {
                break;
            }
            match events.recv().await {
                Ok(event) => {
                    if event.is_local {
                        continue;
                    }
                    let is_echo =
                        was_revision_from_pull_replication(&identity, &event.doc.rev.hash, &event.doc.data, event.doc.deleted);
                    if !is_echo {
                        state.run(true).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

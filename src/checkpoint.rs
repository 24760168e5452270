//! Checkpoint store: persists `(lastPushSequence, lastPullDocument)` per
//! replication identity in a single dedicated auxiliary document rather
//! than a row per scalar.

use crate::collection::LocalDocumentsStore;
use crate::error::{Error, Result};
use crate::types::{Checkpoint, Sequence, WithDeleted};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Derives the local-document id for a replication identity's checkpoint.
/// No cross-identity coupling: each identity gets its own document.
fn checkpoint_doc_id(identity: &str) -> String {
    format!("_local/replication-checkpoint-{identity}")
}

pub struct CheckpointStore<D> {
    store: Arc<dyn LocalDocumentsStore>,
    identity: String,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Clone for CheckpointStore<D> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), identity: self.identity.clone(), _marker: PhantomData }
    }
}

impl<D: Serialize + DeserializeOwned> CheckpointStore<D> {
    pub fn new(store: Arc<dyn LocalDocumentsStore>, identity: impl Into<String>) -> Self {
        Self { store, identity: identity.into(), _marker: PhantomData }
    }

    async fn load(&self) -> Result<Checkpoint<D>> {
        let id = checkpoint_doc_id(&self.identity);
        match self.store.get(&id).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|_| Error::ShouldNotHappen("stored checkpoint document was malformed")),
            None => Ok(Checkpoint::default()),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint<D>) -> Result<()> {
        let id = checkpoint_doc_id(&self.identity);
        let value = serde_json::to_value(checkpoint)
            .map_err(|_| Error::ShouldNotHappen("checkpoint did not serialize to JSON"))?;
        self.store.set(&id, value).await
    }

    /// Defaults to `0` when no checkpoint has ever been persisted.
    pub async fn get_last_push_sequence(&self) -> Result<Sequence> {
        Ok(self.load().await?.last_push_sequence)
    }

    /// Idempotent upsert. The store itself does not validate monotonicity
    /// -- callers always pass the max of the batch just pushed, which the
    /// cycle runner guarantees.
    pub async fn set_last_push_sequence(&self, seq: Sequence) -> Result<()> {
        let mut checkpoint = self.load().await?;
        checkpoint.last_push_sequence = seq;
        self.save(&checkpoint).await
    }

    pub async fn get_last_pull_document(&self) -> Result<Option<WithDeleted<D>>> {
        Ok(self.load().await?.last_pull_document)
    }

    pub async fn set_last_pull_document(&self, doc: WithDeleted<D>) -> Result<()> {
        let mut checkpoint = self.load().await?;
        checkpoint.last_pull_document = Some(doc);
        self.save(&checkpoint).await
    }
}

//! Change collector: the next batch of locally-changed documents
//! that have not already echoed in from this replication's own pull side.

use crate::collection::ChangeFeed;
use crate::error::Result;
use crate::revision::was_revision_from_pull_replication;
use crate::types::{DocumentId, PushChangeRow, Sequence};
use indexmap::IndexMap;
use serde::Serialize;

/// Result of one change-collector pass: the distinct, filtered, changed
/// documents keyed by id, and the feed sequence to persist as the new
/// `lastPushSequence` regardless of how many entries were retained.
///
/// `changed_docs` preserves first-insertion order (re-inserting an id on a
/// later event updates its row in place rather than moving it), matching the
/// order downstream consumers push and emit entries in.
pub struct ChangeBatch<D> {
    pub changed_docs: IndexMap<DocumentId, PushChangeRow<D>>,
    pub last_sequence: Sequence,
}

/// Read the local change feed starting immediately after `after`, keeping at
/// most `batch_size` distinct document ids (latest change per id wins),
/// filtering out any change whose current revision was produced by this
/// replication's own pull.
pub async fn get_changes_since_last_push_sequence<D: Serialize>(
    feed: &dyn ChangeFeed<D>,
    identity: &str,
    after: Sequence,
    batch_size: usize,
) -> Result<ChangeBatch<D>> {
    let events = feed.changes_since(after).await?;
    let mut changed_docs = IndexMap::new();
    let mut last_sequence = after;

    for event in events {
        last_sequence = event.sequence;

        let from_pull = was_revision_from_pull_replication(
            identity,
            &event.doc.rev.hash,
            &event.doc.data,
            event.doc.deleted,
        );
        if !from_pull {
            changed_docs.insert(event.doc.id.clone(), PushChangeRow { doc: event.doc, sequence: event.sequence });
        }

        if changed_docs.len() >= batch_size {
            break;
        }
    }

    Ok(ChangeBatch { changed_docs, last_sequence })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::ChangeFeedEvent;
    use crate::revision::create_revision_for_pulled_document;
    use crate::types::{LocalStoredDoc, Revision, WithDeleted};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::HashMap as StdHashMap;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
    }

    struct FakeFeed {
        events: Vec<ChangeFeedEvent<Doc>>,
    }

    #[async_trait]
    impl ChangeFeed<Doc> for FakeFeed {
        async fn changes_since(&self, after: Sequence) -> Result<Vec<ChangeFeedEvent<Doc>>> {
            Ok(self.events.iter().filter(|e| e.sequence > after).cloned().collect())
        }
    }

    fn local_write(id: &str, name: &str, height: u64) -> LocalStoredDoc<Doc> {
        LocalStoredDoc {
            id: id.to_string(),
            data: Doc { name: name.to_string() },
            rev: Revision::new(height, format!("localhash{height}")),
            deleted: false,
            attachments: StdHashMap::new(),
        }
    }

    fn pulled_write(identity: &str, id: &str, name: &str, height: u64) -> LocalStoredDoc<Doc> {
        let data = Doc { name: name.to_string() };
        let hash = create_revision_for_pulled_document(identity, &WithDeleted::new(&data, false));
        LocalStoredDoc { id: id.to_string(), data, rev: Revision::new(height, hash), deleted: false, attachments: StdHashMap::new() }
    }

    #[tokio::test]
    async fn keeps_only_the_latest_change_per_id() {
        let feed = FakeFeed {
            events: vec![
                ChangeFeedEvent { sequence: 1, doc: local_write("a", "v1", 1) },
                ChangeFeedEvent { sequence: 2, doc: local_write("a", "v2", 2) },
            ],
        };
        let batch = get_changes_since_last_push_sequence(&feed, "ident", 0, 10).await.unwrap();
        assert_eq!(batch.changed_docs.len(), 1);
        assert_eq!(batch.changed_docs["a"].doc.data.name, "v2");
        assert_eq!(batch.last_sequence, 2);
    }

    #[tokio::test]
    async fn filters_out_pull_tagged_revisions() {
        let feed = FakeFeed {
            events: vec![
                ChangeFeedEvent { sequence: 1, doc: local_write("a", "local", 1) },
                ChangeFeedEvent { sequence: 2, doc: pulled_write("ident", "b", "remote", 1) },
            ],
        };
        let batch = get_changes_since_last_push_sequence(&feed, "ident", 0, 10).await.unwrap();
        assert_eq!(batch.changed_docs.len(), 1);
        assert!(batch.changed_docs.contains_key("a"));
        assert_eq!(batch.last_sequence, 2, "cursor still advances past the filtered entry");
    }

    #[tokio::test]
    async fn stops_once_batch_size_distinct_ids_reached() {
        let feed = FakeFeed {
            events: vec![
                ChangeFeedEvent { sequence: 1, doc: local_write("a", "v", 1) },
                ChangeFeedEvent { sequence: 2, doc: local_write("b", "v", 1) },
                ChangeFeedEvent { sequence: 3, doc: local_write("c", "v", 1) },
            ],
        };
        let batch = get_changes_since_last_push_sequence(&feed, "ident", 0, 2).await.unwrap();
        assert_eq!(batch.changed_docs.len(), 2);
        assert_eq!(batch.last_sequence, 2);
    }
}

//! Process-local document store used by tests and single-node deployments.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{self, BoxFuture};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{
    ChangeStream, DocumentStore, FieldEquals, UpdateOutcome, WriteMode, merge_fields,
};
use crate::dao::storage::StorageResult;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

type DocumentKey = (&'static str, String);

#[derive(Clone, Debug)]
struct ChangeEvent {
    collection: &'static str,
    key: String,
    value: Option<Value>,
}

/// [`DocumentStore`] backed by a concurrent hash map.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    documents: DashMap<DocumentKey, Value>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    /// Empty store.
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                documents: DashMap::new(),
                changes,
            }),
        }
    }

    fn read(&self, collection: &'static str, key: &str) -> Option<Value> {
        self.inner
            .documents
            .get(&(collection, key.to_owned()))
            .map(|entry| entry.value().clone())
    }

    fn publish(&self, collection: &'static str, key: &str, value: Option<Value>) {
        // No subscribers is the common case.
        let _ = self.inner.changes.send(ChangeEvent {
            collection,
            key: key.to_owned(),
            value,
        });
    }

    fn create_now(&self, collection: &'static str, key: &str, value: Value) -> bool {
        let inserted = match self.inner.documents.entry((collection, key.to_owned())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                true
            }
        };
        if inserted {
            self.publish(collection, key, Some(value));
        }
        inserted
    }

    fn set_now(&self, collection: &'static str, key: &str, value: Value, mode: WriteMode) {
        let stored = match self.inner.documents.entry((collection, key.to_owned())) {
            Entry::Occupied(mut slot) => {
                match mode {
                    WriteMode::Replace => *slot.get_mut() = value,
                    WriteMode::Merge => merge_fields(slot.get_mut(), value),
                }
                slot.get().clone()
            }
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                value
            }
        };
        self.publish(collection, key, Some(stored));
    }

    fn update_now(
        &self,
        collection: &'static str,
        key: &str,
        partial: Value,
        precondition: Option<&FieldEquals>,
    ) -> UpdateOutcome {
        let updated = {
            let Some(mut entry) = self.inner.documents.get_mut(&(collection, key.to_owned()))
            else {
                return UpdateOutcome::Missing;
            };
            if let Some(test) = precondition
                && !test.matches(entry.value())
            {
                return UpdateOutcome::PreconditionFailed;
            }
            merge_fields(entry.value_mut(), partial);
            entry.value().clone()
        };
        self.publish(collection, key, Some(updated));
        UpdateOutcome::Applied
    }

    fn delete_now(
        &self,
        collection: &'static str,
        key: &str,
        precondition: Option<&FieldEquals>,
    ) -> bool {
        let removed = self
            .inner
            .documents
            .remove_if(&(collection, key.to_owned()), |_, value| {
                precondition.is_none_or(|test| test.matches(value))
            })
            .is_some();
        if removed {
            self.publish(collection, key, None);
        }
        removed
    }

    fn list_now(&self, collection: &'static str, filter: Option<&FieldEquals>) -> Vec<Value> {
        self.inner
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .filter(|entry| filter.is_none_or(|test| test.matches(entry.value())))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(
        &self,
        collection: &'static str,
        key: &str,
    ) -> BoxFuture<'static, StorageResult<Option<Value>>> {
        Box::pin(future::ready(Ok(self.read(collection, key))))
    }

    fn create(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        Box::pin(future::ready(Ok(self.create_now(collection, key, value))))
    }

    fn set(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
        mode: WriteMode,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.set_now(collection, key, value, mode);
        Box::pin(future::ready(Ok(())))
    }

    fn update(
        &self,
        collection: &'static str,
        key: &str,
        partial: Value,
        precondition: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<UpdateOutcome>> {
        let outcome = self.update_now(collection, key, partial, precondition.as_ref());
        Box::pin(future::ready(Ok(outcome)))
    }

    fn delete(
        &self,
        collection: &'static str,
        key: &str,
        precondition: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let removed = self.delete_now(collection, key, precondition.as_ref());
        Box::pin(future::ready(Ok(removed)))
    }

    fn list(
        &self,
        collection: &'static str,
        filter: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<Vec<Value>>> {
        Box::pin(future::ready(Ok(self.list_now(collection, filter.as_ref()))))
    }

    fn watch(&self, collection: &'static str, key: &str) -> ChangeStream {
        // Subscribe before the initial read so no change can slip between them.
        let mut receiver = self.inner.changes.subscribe();
        let store = self.clone();
        let key = key.to_owned();

        Box::pin(async_stream::stream! {
            yield Ok(store.read(collection, &key));

            loop {
                match receiver.recv().await {
                    Ok(event) if event.collection == collection && event.key == key => {
                        yield Ok(event.value);
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {
                        yield Ok(store.read(collection, &key));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(future::ready(Ok(())))
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(future::ready(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    const COLLECTION: &str = "store_intake";

    #[tokio::test]
    async fn conditional_update_checks_current_value() {
        let store = MemoryDocumentStore::new();
        store
            .set(COLLECTION, "k", json!({"status": "critical"}), WriteMode::Replace)
            .await
            .unwrap();

        let first = store
            .update(
                COLLECTION,
                "k",
                json!({"status": "released"}),
                Some(FieldEquals::text("status", "critical")),
            )
            .await
            .unwrap();
        let second = store
            .update(
                COLLECTION,
                "k",
                json!({"status": "released"}),
                Some(FieldEquals::text("status", "critical")),
            )
            .await
            .unwrap();

        assert_eq!(first, UpdateOutcome::Applied);
        assert_eq!(second, UpdateOutcome::PreconditionFailed);
        assert_eq!(
            store
                .update(COLLECTION, "absent", json!({}), None)
                .await
                .unwrap(),
            UpdateOutcome::Missing
        );
    }

    #[tokio::test]
    async fn conditional_delete_reports_single_winner() {
        let store = MemoryDocumentStore::new();
        store
            .set("discs", "d1", json!({"owner_id": "p1"}), WriteMode::Replace)
            .await
            .unwrap();

        let wrong_owner = store
            .delete("discs", "d1", Some(FieldEquals::text("owner_id", "p2")))
            .await
            .unwrap();
        let first = store
            .delete("discs", "d1", Some(FieldEquals::text("owner_id", "p1")))
            .await
            .unwrap();
        let second = store
            .delete("discs", "d1", Some(FieldEquals::text("owner_id", "p1")))
            .await
            .unwrap();

        assert!(!wrong_owner);
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let store = MemoryDocumentStore::new();
        assert!(store.create("players", "p1", json!({"a": 1})).await.unwrap());
        assert!(!store.create("players", "p1", json!({"a": 2})).await.unwrap());
        assert_eq!(
            store.get("players", "p1").await.unwrap(),
            Some(json!({"a": 1}))
        );
    }

    #[tokio::test]
    async fn merge_set_keeps_unrelated_fields() {
        let store = MemoryDocumentStore::new();
        store
            .set("players", "p1", json!({"user_id": "p1", "push_token": "t"}), WriteMode::Replace)
            .await
            .unwrap();
        store
            .set("players", "p1", json!({"push_token": "u"}), WriteMode::Merge)
            .await
            .unwrap();

        assert_eq!(
            store.get("players", "p1").await.unwrap(),
            Some(json!({"user_id": "p1", "push_token": "u"}))
        );
    }

    #[tokio::test]
    async fn list_filters_by_collection_and_field() {
        let store = MemoryDocumentStore::new();
        store
            .set(COLLECTION, "a", json!({"disc_uid": "d1"}), WriteMode::Replace)
            .await
            .unwrap();
        store
            .set(COLLECTION, "b", json!({"disc_uid": "d2"}), WriteMode::Replace)
            .await
            .unwrap();
        store
            .set("discs", "d1", json!({"disc_uid": "d1"}), WriteMode::Replace)
            .await
            .unwrap();

        let all = store.list(COLLECTION, None).await.unwrap();
        let filtered = store
            .list(COLLECTION, Some(FieldEquals::text("disc_uid", "d1")))
            .await
            .unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(filtered, vec![json!({"disc_uid": "d1"})]);
    }

    #[tokio::test]
    async fn watch_yields_current_value_then_changes() {
        let store = MemoryDocumentStore::new();
        let mut changes = store.watch("notifications", "p1");

        assert_eq!(changes.next().await.unwrap().unwrap(), None);

        store
            .set("notifications", "other", json!({"n": 0}), WriteMode::Replace)
            .await
            .unwrap();
        store
            .set("notifications", "p1", json!({"n": 1}), WriteMode::Replace)
            .await
            .unwrap();
        store.delete("notifications", "p1", None).await.unwrap();

        assert_eq!(changes.next().await.unwrap().unwrap(), Some(json!({"n": 1})));
        assert_eq!(changes.next().await.unwrap().unwrap(), None);
    }
}

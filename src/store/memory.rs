//! In-process document store with push-based snapshots.
//!
//! Besides being an embeddable store for demos, this is the controllable
//! fake used by widget tests: write latency can be injected to line up the
//! create-fallback race, writes can be denied wholesale, and every issued
//! write is recorded in order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::Mutex, time};

use super::{
    Document, DocumentStore, Fields, Snapshot, SnapshotPublishers, StoreError, Subscription,
};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Increment {
        collection: String,
        id: String,
        field: String,
        by: i64,
    },
    Create {
        collection: String,
        id: String,
        fields: Fields,
    },
}

struct Inner {
    collections: Mutex<HashMap<String, BTreeMap<String, Fields>>>,
    publishers: SnapshotPublishers,
    writes: StdMutex<Vec<WriteOp>>,
    write_delay: StdMutex<Option<Duration>>,
    deny_writes: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: Mutex::new(HashMap::new()),
                publishers: SnapshotPublishers::new(),
                writes: StdMutex::new(Vec::new()),
                write_delay: StdMutex::new(None),
                deny_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Injects latency before every write is applied. Lets a test hold two
    /// clients at the same point of the increment-then-create sequence.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.inner.write_delay.lock().unwrap() = delay;
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn deny_writes(&self, deny: bool) {
        self.inner.deny_writes.store(deny, Ordering::Relaxed);
    }

    /// Every write issued so far, in issue order (including denied ones and
    /// increments that failed on a missing document).
    pub fn writes(&self) -> Vec<WriteOp> {
        self.inner.writes.lock().unwrap().clone()
    }

    /// Current numeric field value, if the document exists.
    pub async fn count(&self, collection: &str, id: &str, field: &str) -> Option<i64> {
        let collections = self.inner.collections.lock().await;
        collections.get(collection)?.get(id)?.get(field)?.as_i64()
    }

    async fn simulate_latency(&self) {
        let delay = *self.inner.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
    }

    fn record(&self, op: WriteOp) {
        self.inner.writes.lock().unwrap().push(op);
    }

    fn check_denied(&self) -> Result<(), StoreError> {
        if self.inner.deny_writes.load(Ordering::Relaxed) {
            Err(StoreError::Backend("writes are disabled".into()))
        } else {
            Ok(())
        }
    }
}

fn snapshot_of(documents: &BTreeMap<String, Fields>) -> Snapshot {
    Snapshot::new(
        documents
            .iter()
            .map(|(id, fields)| Document {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect(),
    )
}

fn missing(collection: &str, id: &str) -> StoreError {
    StoreError::MissingDocument {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        by: i64,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.record(WriteOp::Increment {
            collection: collection.to_string(),
            id: id.to_string(),
            field: field.to_string(),
            by,
        });
        self.check_denied()?;

        let mut collections = self.inner.collections.lock().await;
        let documents = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection, id))?;
        let document = documents.get_mut(id).ok_or_else(|| missing(collection, id))?;

        let current = document.get(field).and_then(Value::as_i64).unwrap_or(0);
        document.insert(field.to_string(), Value::from(current + by));

        self.inner.publishers.publish(collection, snapshot_of(documents));
        Ok(())
    }

    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.record(WriteOp::Create {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
        });
        self.check_denied()?;

        let mut collections = self.inner.collections.lock().await;
        let documents = collections.entry(collection.to_string()).or_default();
        documents.insert(id.to_string(), fields);

        self.inner.publishers.publish(collection, snapshot_of(documents));
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError> {
        // Register and seed under the data lock so no write can slip between
        // the initial snapshot and the first push.
        let collections = self.inner.collections.lock().await;
        let rx = self.inner.publishers.register(collection);
        let snapshot = collections.get(collection).map(snapshot_of).unwrap_or_default();
        self.inner.publishers.publish(collection, snapshot);
        Ok(Subscription::new(collection, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::COUNT_FIELD;

    fn count_fields(count: i64) -> Fields {
        let mut fields = Fields::new();
        fields.insert(COUNT_FIELD.to_string(), Value::from(count));
        fields
    }

    #[tokio::test]
    async fn increment_on_missing_document_fails() {
        let store = MemoryStore::new();
        let err = store
            .increment("ratings", "fire", COUNT_FIELD, 1)
            .await
            .unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn create_then_increment() {
        let store = MemoryStore::new();
        store.create("ratings", "fire", count_fields(1)).await.unwrap();
        store
            .increment("ratings", "fire", COUNT_FIELD, 1)
            .await
            .unwrap();
        assert_eq!(store.count("ratings", "fire", COUNT_FIELD).await, Some(2));
    }

    #[tokio::test]
    async fn create_overwrites_existing_document() {
        let store = MemoryStore::new();
        store.create("ratings", "goat", count_fields(1)).await.unwrap();
        store
            .increment("ratings", "goat", COUNT_FIELD, 4)
            .await
            .unwrap();
        // Blind create clobbers the accumulated count, by contract.
        store.create("ratings", "goat", count_fields(1)).await.unwrap();
        assert_eq!(store.count("ratings", "goat", COUNT_FIELD).await, Some(1));
    }

    #[tokio::test]
    async fn subscription_sees_initial_and_pushed_snapshots() {
        let store = MemoryStore::new();
        store.create("ratings", "fire", count_fields(7)).await.unwrap();

        let mut subscription = store.subscribe("ratings").await.unwrap();
        let initial = subscription.latest();
        assert_eq!(initial.get("fire").unwrap().number(COUNT_FIELD), 7);

        store
            .increment("ratings", "fire", COUNT_FIELD, 1)
            .await
            .unwrap();
        let next = subscription.changed().await.unwrap();
        assert_eq!(next.get("fire").unwrap().number(COUNT_FIELD), 8);
    }

    #[tokio::test]
    async fn denied_writes_fail_but_are_recorded() {
        let store = MemoryStore::new();
        store.deny_writes(true);
        let err = store
            .create("ratings", "mid", count_fields(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.writes().len(), 1);
        assert_eq!(store.count("ratings", "mid", COUNT_FIELD).await, None);
    }
}

//! Document store seam: the four primitives the widget consumes.
//!
//! The widget only ever issues a field increment, a create-with-initial-fields,
//! and a collection subscription; everything else (durability, multi-client
//! fan-out) belongs to the store implementation behind the trait.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

mod memory;
mod migrations;
mod sqlite;

pub use memory::{MemoryStore, WriteOp};
pub use sqlite::SqliteStore;

/// Collection holding one counter document per category.
pub const RATINGS_COLLECTION: &str = "ratings";
/// The single numeric field on a counter document.
pub const COUNT_FIELD: &str = "count";

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    /// Numeric field accessor; missing or non-numeric fields read as 0.
    pub fn number(&self, field: &str) -> i64 {
        self.fields.get(field).and_then(Value::as_i64).unwrap_or(0)
    }
}

/// Full current set of documents in a subscribed collection.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    documents: Arc<Vec<Document>>,
}

impl Snapshot {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: Arc::new(documents),
        }
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|doc| doc.id == id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The one failure the widget distinguishes: it triggers the
    /// create-with-count-1 fallback.
    #[error("document {collection}/{id} does not exist")]
    MissingDocument { collection: String, id: String },
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("subscription closed by the store")]
    SubscriptionClosed,
}

impl StoreError {
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::MissingDocument { .. })
    }
}

/// Scoped live-read handle over one collection. Dropping it releases the
/// subscription; the store keeps pushing to other subscribers.
pub struct Subscription {
    id: Uuid,
    collection: String,
    rx: watch::Receiver<Snapshot>,
}

impl Subscription {
    pub(crate) fn new(collection: &str, rx: watch::Receiver<Snapshot>) -> Self {
        let id = Uuid::new_v4();
        debug!("subscription {id} to '{collection}' acquired");
        Self {
            id,
            collection: collection.to_string(),
            rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Most recent snapshot delivered so far (available immediately after
    /// subscribing).
    pub fn latest(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    /// Waits for the next pushed snapshot.
    pub async fn changed(&mut self) -> Result<Snapshot, StoreError> {
        self.rx
            .changed()
            .await
            .map_err(|_| StoreError::SubscriptionClosed)?;
        Ok(self.rx.borrow().clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("subscription {} to '{}' released", self.id, self.collection);
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Atomically adds `by` to a numeric field of an existing document.
    /// Fails with [`StoreError::MissingDocument`] when the document is absent.
    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        by: i64,
    ) -> Result<(), StoreError>;

    /// Creates a document with the given initial fields. Overwrites an
    /// existing document with the same id (last writer wins).
    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError>;

    /// Opens a live subscription over a collection. The current snapshot is
    /// available right away; a new full snapshot is pushed after every write.
    async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError>;
}

/// One watch channel per collection, shared by every subscriber. `publish`
/// is a no-op until the first subscriber registers the channel.
pub(crate) struct SnapshotPublishers {
    senders: Mutex<HashMap<String, watch::Sender<Snapshot>>>,
}

impl SnapshotPublishers {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, collection: &str) -> watch::Receiver<Snapshot> {
        let mut senders = self.senders.lock().unwrap();
        match senders.get(collection) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(Snapshot::default());
                senders.insert(collection.to_string(), tx);
                rx
            }
        }
    }

    pub(crate) fn publish(&self, collection: &str, snapshot: Snapshot) {
        if let Some(tx) = self.senders.lock().unwrap().get(collection) {
            tx.send_replace(snapshot);
        }
    }
}

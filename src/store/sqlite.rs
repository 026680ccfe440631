//! Persistent document store over SQLite.
//!
//! A dedicated worker thread owns the connection; async callers hand it
//! closures over an mpsc channel and await the reply on a oneshot. Each
//! write reloads the collection and publishes the snapshot from within its
//! worker task, so subscribers see snapshots in write order.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::oneshot;

use super::{
    migrations::run_migrations, Document, DocumentStore, Fields, Snapshot, SnapshotPublishers,
    StoreError, Subscription,
};

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct SqliteStoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SqliteStoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteStoreInner>,
    publishers: Arc<SnapshotPublishers>,
    db_path: Arc<PathBuf>,
}

impl SqliteStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("ratebox-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run store migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("Document store initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(SqliteStoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            publishers: Arc::new(SnapshotPublishers::new()),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }

}

fn load_snapshot(conn: &Connection, collection: &str) -> Result<Snapshot> {
    let mut stmt = conn.prepare(
        "SELECT id, fields FROM documents
         WHERE collection = ?1
         ORDER BY id",
    )?;

    let mut rows = stmt.query(params![collection])?;
    let mut documents = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let raw: String = row.get(1)?;
        documents.push(Document {
            id,
            fields: parse_fields(&raw)?,
        });
    }

    Ok(Snapshot::new(documents))
}

/// Runs on the worker thread, right after a write, so snapshots go out in
/// write order. A publish failure never fails a write that already landed.
fn publish_current(conn: &Connection, publishers: &SnapshotPublishers, collection: &str) {
    match load_snapshot(conn, collection) {
        Ok(snapshot) => publishers.publish(collection, snapshot),
        Err(err) => warn!("Failed to publish snapshot for '{collection}': {err:#}"),
    }
}

fn parse_fields(raw: &str) -> Result<Fields> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("document fields are not a JSON object: {other}")),
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        by: i64,
    ) -> Result<(), StoreError> {
        let collection_name = collection.to_string();
        let doc_id = id.to_string();
        let field_path = format!("$.{field}");
        let publishers = self.publishers.clone();

        let rows = self
            .execute(move |conn| {
                let now = Utc::now().to_rfc3339();
                let rows = conn
                    .execute(
                        "UPDATE documents
                         SET fields = json_set(fields, ?1, COALESCE(json_extract(fields, ?1), 0) + ?2),
                             updated_at = ?3
                         WHERE collection = ?4 AND id = ?5",
                        params![field_path, by, now, collection_name, doc_id],
                    )
                    .with_context(|| "failed to increment document field")?;

                if rows > 0 {
                    publish_current(conn, &publishers, &collection_name);
                }
                Ok(rows)
            })
            .await
            .map_err(backend)?;

        if rows == 0 {
            return Err(StoreError::MissingDocument {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        let collection_name = collection.to_string();
        let doc_id = id.to_string();
        let serialized = Value::Object(fields).to_string();
        let publishers = self.publishers.clone();

        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO documents (collection, id, fields, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(collection, id) DO UPDATE SET
                     fields = excluded.fields,
                     updated_at = excluded.updated_at",
                params![collection_name, doc_id, serialized, now],
            )
            .with_context(|| "failed to create document")?;

            publish_current(conn, &publishers, &collection_name);
            Ok(())
        })
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError> {
        // Register the channel first, then seed it from the worker thread:
        // loads and publishes all run on the worker, in queue order, so a
        // concurrent write can never clobber the channel with an older
        // snapshot.
        let rx = self.publishers.register(collection);
        let collection_name = collection.to_string();
        let publishers = self.publishers.clone();

        self.execute(move |conn| {
            let snapshot = load_snapshot(conn, &collection_name)?;
            publishers.publish(&collection_name, snapshot);
            Ok(())
        })
        .await
        .map_err(backend)?;

        Ok(Subscription::new(collection, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::COUNT_FIELD;
    use tempfile::tempdir;

    fn count_fields(count: i64) -> Fields {
        let mut fields = Fields::new();
        fields.insert(COUNT_FIELD.to_string(), Value::from(count));
        fields
    }

    #[tokio::test]
    async fn increment_on_missing_document_fails() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ratings.sqlite3")).unwrap();

        let err = store
            .increment("ratings", "fire", COUNT_FIELD, 1)
            .await
            .unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn counts_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ratings.sqlite3");

        {
            let store = SqliteStore::open(path.clone()).unwrap();
            store.create("ratings", "fire", count_fields(1)).await.unwrap();
            store
                .increment("ratings", "fire", COUNT_FIELD, 2)
                .await
                .unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        let subscription = store.subscribe("ratings").await.unwrap();
        let snapshot = subscription.latest();
        assert_eq!(snapshot.get("fire").unwrap().number(COUNT_FIELD), 3);
    }

    #[tokio::test]
    async fn writes_push_snapshots_to_subscribers() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ratings.sqlite3")).unwrap();

        let mut subscription = store.subscribe("ratings").await.unwrap();
        assert!(subscription.latest().is_empty());

        store.create("ratings", "goat", count_fields(1)).await.unwrap();
        let snapshot = subscription.changed().await.unwrap();
        assert_eq!(snapshot.get("goat").unwrap().number(COUNT_FIELD), 1);

        store
            .increment("ratings", "goat", COUNT_FIELD, 1)
            .await
            .unwrap();
        let snapshot = subscription.changed().await.unwrap();
        assert_eq!(snapshot.get("goat").unwrap().number(COUNT_FIELD), 2);
    }

    #[tokio::test]
    async fn concurrent_increments_settle_on_the_latest_snapshot() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ratings.sqlite3")).unwrap();
        store.create("ratings", "fire", count_fields(0)).await.unwrap();

        let subscription = store.subscribe("ratings").await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment("ratings", "fire", COUNT_FIELD, 1)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // Every increment publishes from the worker thread before replying,
        // so once all writes have returned the channel must hold the final
        // count, not some interleaving's stale snapshot.
        let snapshot = subscription.latest();
        assert_eq!(snapshot.get("fire").unwrap().number(COUNT_FIELD), 16);
    }

    #[tokio::test]
    async fn increment_succeeds_even_when_the_snapshot_cannot_be_published() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ratings.sqlite3");
        let store = SqliteStore::open(path.clone()).unwrap();
        store.create("ratings", "fire", count_fields(3)).await.unwrap();

        // Corrupt a sibling row so reloading the collection fails to parse.
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO documents (collection, id, fields, created_at, updated_at)
             VALUES ('ratings', 'broken', 'not-json', '', '')",
            [],
        )
        .unwrap();

        // The update itself landed, so the write must not be reported as a
        // failure (a caller would otherwise fall back to create and clobber
        // the accumulated count).
        store
            .increment("ratings", "fire", COUNT_FIELD, 1)
            .await
            .unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT json_extract(fields, '$.count') FROM documents
                 WHERE collection = 'ratings' AND id = 'fire'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn create_overwrites_existing_document() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ratings.sqlite3")).unwrap();

        store.create("ratings", "mid", count_fields(1)).await.unwrap();
        store
            .increment("ratings", "mid", COUNT_FIELD, 5)
            .await
            .unwrap();
        store.create("ratings", "mid", count_fields(1)).await.unwrap();

        let subscription = store.subscribe("ratings").await.unwrap();
        assert_eq!(subscription.latest().get("mid").unwrap().number(COUNT_FIELD), 1);
    }
}

//! Engine: the registry of collections and owner of all background tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bulklog_common::{Clock, Store, SystemClock};

use crate::buffer::Buffer;
use crate::collection::Collection;
use crate::consumer::{consumer_set, Consumer, ConsumerSet};
use crate::convey;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::keys;
use crate::pipe::Pipe;

struct BufferEntry {
    buffer: Arc<Buffer>,
    flusher: JoinHandle<()>,
}

/// The delivery engine.
///
/// Owns one buffer and one flusher task per registered collection, and
/// spawns one convey task per live pipe. The store connection is shared by
/// everything the engine runs.
///
/// Closing the engine stops the flushers but deliberately leaves convey
/// tasks running: in-flight retries finish on their own schedule, and
/// anything cut short by process exit is re-adopted from the shared store
/// on the next start.
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    buffers: RwLock<HashMap<String, BufferEntry>>,
}

impl Engine {
    /// Creates an engine over the given store, using the system clock.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates an engine with an explicit clock. Used by tests to control
    /// flush cadence and retention.
    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a collection with its consumer set.
    ///
    /// Adopts any pipes a previous instance left under the collection's
    /// namespace, then starts the flusher. The consumer set is fixed until
    /// the engine is rebuilt.
    pub async fn register(
        &self,
        collection: Collection,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> Result<()> {
        let mut buffers = self.buffers.write().await;
        if buffers.contains_key(&collection.name) {
            return Err(Error::DuplicateCollection(collection.name));
        }

        let consumers = consumer_set(consumers);
        self.convey_existing(&collection, &consumers).await?;

        let buffer = Arc::new(Buffer::new(
            Arc::clone(&self.store),
            collection.clone(),
            consumers,
            Arc::clone(&self.clock),
        ));
        let flusher = tokio::spawn(Arc::clone(&buffer).run_flusher());

        info!(collection = %collection.name, "collection registered");
        buffers.insert(collection.name, BufferEntry { buffer, flusher });
        Ok(())
    }

    /// Spawns convey tasks for every pipe already present under the
    /// collection's namespace (restart recovery; a fresh in-memory store
    /// simply has none).
    async fn convey_existing(
        &self,
        collection: &Collection,
        consumers: &ConsumerSet,
    ) -> Result<()> {
        let prefix = keys::pipe_prefix(&collection.name);
        for key in self.store.enumerate(&prefix).await? {
            let Some(id) = keys::parse_pipe_id(&prefix, &key) else {
                continue;
            };
            match Pipe::load(self.store.as_ref(), &collection.name, id).await {
                Ok(Some(pipe)) => {
                    info!(
                        collection = %collection.name,
                        pipe = %id,
                        "adopting existing pipe"
                    );
                    convey::spawn_convey(
                        Arc::clone(&self.store),
                        pipe,
                        consumers.clone(),
                        collection.backoff,
                        Arc::clone(&self.clock),
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        collection = %collection.name,
                        pipe = %id,
                        error = %err,
                        "skipping unreadable pipe record"
                    );
                }
            }
        }
        Ok(())
    }

    /// Appends a document to the named collection's buffer.
    pub async fn append(&self, collection: &str, doc: &Document) -> Result<()> {
        let buffers = self.buffers.read().await;
        let entry = buffers
            .get(collection)
            .ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
        entry.buffer.append(doc).await
    }

    /// Stops every flusher and waits for them to exit.
    ///
    /// Convey tasks keep running until their pipes retire; a hard shutdown
    /// abandons them and relies on restart recovery instead.
    pub async fn close(&self) {
        let mut buffers = self.buffers.write().await;
        for (name, entry) in buffers.drain() {
            entry.buffer.close();
            if let Err(err) = entry.flusher.await {
                warn!(collection = %name, error = %err, "flusher task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use uuid::Uuid;

    use bulklog_common::store::memory::MemoryStore;
    use bulklog_common::TokioClock;

    use crate::consumer::testing::RecordingConsumer;
    use crate::pipe::Pipe;

    fn test_collection() -> Collection {
        Collection::new("audit", Duration::from_secs(1), Duration::from_secs(10)).unwrap()
    }

    fn test_engine(store: &MemoryStore) -> Engine {
        Engine::with_clock(Arc::new(store.clone()), Arc::new(TokioClock::new()))
    }

    #[tokio::test]
    async fn should_reject_duplicate_collection() {
        // given
        let store = MemoryStore::new();
        let engine = test_engine(&store);
        engine
            .register(test_collection(), vec![])
            .await
            .unwrap();

        // when
        let result = engine.register(test_collection(), vec![]).await;

        // then
        assert!(matches!(result, Err(Error::DuplicateCollection(_))));

        // cleanup
        engine.close().await;
    }

    #[tokio::test]
    async fn should_reject_append_to_unknown_collection() {
        // given
        let store = MemoryStore::new();
        let engine = test_engine(&store);
        let doc = Document::new("audit", "v1", b"{}").unwrap();

        // when
        let result = engine.append("audit", &doc).await;

        // then
        assert!(matches!(result, Err(Error::UnknownCollection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn should_flush_and_deliver_on_cadence() {
        // given
        let store = MemoryStore::new();
        let engine = test_engine(&store);
        let consumer = RecordingConsumer::new("indexer");
        engine
            .register(
                test_collection(),
                vec![consumer.clone() as Arc<dyn Consumer>],
            )
            .await
            .unwrap();
        let doc = Document::new("audit", "v1", br#"{"n": 1}"#).unwrap();

        // when - the flusher seals at t+1s, the consumer is attempted one
        // flush period later
        engine.append("audit", &doc).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // then
        assert_eq!(consumer.call_count(), 1);
        assert_eq!(consumer.batches(), vec![vec![doc.id]]);
        let pipe_keys = store.enumerate("bulklog.audit.pipes").await.unwrap();
        assert!(pipe_keys.is_empty(), "pipe not retired: {pipe_keys:?}");

        // cleanup
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn should_adopt_existing_pipes_on_register() {
        // given - a pipe left behind by a crashed instance
        let store = MemoryStore::new();
        let clock = TokioClock::new();
        let collection = test_collection();
        let pipe = Pipe::seal(&collection, Uuid::new_v4(), clock.now());
        let doc = Document::new("audit", "v1", br#"{"n": 1}"#).unwrap();
        let mut tx = store.begin(vec![]).await.unwrap();
        pipe.write_new(
            tx.as_mut(),
            std::iter::once("indexer"),
            clock.now() + chrono::TimeDelta::seconds(1),
        );
        tx.append_list(&pipe.buffer_key(), Bytes::from(doc.encode()));
        assert!(tx.commit().await.unwrap());

        // when - a fresh engine registers the collection
        let engine = test_engine(&store);
        let consumer = RecordingConsumer::new("indexer");
        engine
            .register(collection, vec![consumer.clone() as Arc<dyn Consumer>])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // then - the adopted pipe was delivered and retired
        assert_eq!(consumer.call_count(), 1);
        assert_eq!(consumer.batches(), vec![vec![doc.id]]);
        let pipe_keys = store.enumerate("bulklog.audit.pipes").await.unwrap();
        assert!(pipe_keys.is_empty());

        // cleanup
        engine.close().await;
    }
}

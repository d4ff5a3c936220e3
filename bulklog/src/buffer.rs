//! Per-collection buffer and its flusher task.
//!
//! The buffer accumulates encoded documents in a store list. Once per
//! flush period the flusher seals the list into a new pipe inside one
//! optimistic transaction over the buffer list, the flush timestamp and
//! the new pipe's keys. The watch set is what makes several engine
//! instances safe against each other: a concurrent append lands in the
//! next pipe, and of two racing flushers exactly one seals the window
//! (the loser observes the updated timestamp and backs off).

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bulklog_common::{Clock, Store};

use crate::collection::Collection;
use crate::consumer::ConsumerSet;
use crate::convey;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::keys;
use crate::pipe::{self, Pipe};

/// Pause after a failed flush before the flusher tries again.
const FLUSH_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub(crate) struct Buffer {
    store: Arc<dyn Store>,
    collection: Collection,
    consumers: ConsumerSet,
    clock: Arc<dyn Clock>,
    buffer_key: String,
    time_key: String,
    /// Local cache of the last flush decision; the transaction re-reads
    /// the authoritative value from the store.
    flushed_at: Mutex<DateTime<Utc>>,
    cancel: CancellationToken,
}

enum FlushAttempt {
    /// The decision committed; `Some` carries a freshly sealed pipe.
    Committed(Option<Pipe>),
    /// A watched key changed under the transaction.
    Conflict,
}

impl Buffer {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        collection: Collection,
        consumers: ConsumerSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let buffer_key = keys::buffer_key(&collection.name);
        let time_key = keys::flushed_at_key(&collection.name);
        let flushed_at = Mutex::new(clock.now());
        Self {
            store,
            collection,
            consumers,
            clock,
            buffer_key,
            time_key,
            flushed_at,
            cancel: CancellationToken::new(),
        }
    }

    /// Appends one document to the buffer list.
    pub(crate) async fn append(&self, doc: &Document) -> Result<()> {
        self.store
            .append_list(&self.buffer_key, Bytes::from(doc.encode()))
            .await?;
        Ok(())
    }

    /// Runs the flush decision, retrying transaction conflicts and store
    /// failures up to the collection's bound.
    pub(crate) async fn flush(&self) -> Result<()> {
        let max_attempts = self.collection.max_tx_retries.max(1);
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(conflict_delay(attempt)).await;
            }
            match self.try_flush().await {
                Ok(FlushAttempt::Committed(sealed)) => {
                    if let Some(pipe) = sealed {
                        info!(
                            collection = %self.collection.name,
                            pipe = %pipe.id(),
                            "buffer sealed into pipe"
                        );
                        convey::spawn_convey(
                            Arc::clone(&self.store),
                            pipe,
                            self.consumers.clone(),
                            self.collection.backoff,
                            Arc::clone(&self.clock),
                        );
                    }
                    return Ok(());
                }
                Ok(FlushAttempt::Conflict) => {
                    debug!(
                        collection = %self.collection.name,
                        attempt,
                        "flush transaction conflicted, retrying"
                    );
                }
                Err(err) => {
                    warn!(
                        collection = %self.collection.name,
                        attempt,
                        error = %err,
                        "flush attempt failed, retrying"
                    );
                }
            }
        }
        Err(Error::FlushFailed {
            collection: self.collection.name.clone(),
            attempts: max_attempts,
        })
    }

    /// One pass of the flush decision tree, inside a single transaction.
    async fn try_flush(&self) -> Result<FlushAttempt> {
        let now = self.clock.now();
        let pipe = Pipe::seal(&self.collection, Uuid::new_v4(), now);

        let watch = vec![
            self.buffer_key.clone(),
            self.time_key.clone(),
            pipe.meta_key(),
            pipe.consumers_key(),
            pipe.buffer_key(),
        ];
        let mut tx = self.store.begin(watch).await?;

        if let Some(value) = tx.get_str(&self.time_key).await? {
            match pipe::parse_time(&value) {
                Ok(flushed_at) => {
                    self.set_cached_flushed_at(flushed_at);
                    if now - flushed_at < self.collection.flush_delta() {
                        // Another instance flushed this window already.
                        return Ok(FlushAttempt::Committed(None));
                    }
                }
                Err(err) => {
                    warn!(
                        collection = %self.collection.name,
                        error = %err,
                        "unreadable flush timestamp, overwriting"
                    );
                }
            }
        }

        let length = tx.list_len(&self.buffer_key).await?;
        if length == 0 {
            tx.set_str(&self.time_key, &pipe::format_time(now));
            if !tx.commit().await? {
                return Ok(FlushAttempt::Conflict);
            }
            self.set_cached_flushed_at(now);
            return Ok(FlushAttempt::Committed(None));
        }

        pipe.write_new(
            tx.as_mut(),
            self.consumers.keys().map(String::as_str),
            now + self.collection.flush_delta(),
        );
        tx.drain_list_into(&self.buffer_key, &pipe.buffer_key());
        tx.set_str(&self.time_key, &pipe::format_time(now));
        if !tx.commit().await? {
            return Ok(FlushAttempt::Conflict);
        }

        self.set_cached_flushed_at(now);
        debug!(
            collection = %self.collection.name,
            pipe = %pipe.id(),
            documents = length,
            "flush transaction committed"
        );
        Ok(FlushAttempt::Committed(Some(pipe)))
    }

    /// Long-running task: flush once per flush period until closed.
    pub(crate) async fn run_flusher(self: Arc<Self>) {
        debug!(collection = %self.collection.name, "flusher started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let wait_for = self.collection.flush_delta() - (self.clock.now() - self.cached_flushed_at());
            if wait_for <= TimeDelta::zero() {
                if let Err(err) = self.flush().await {
                    error!(
                        collection = %self.collection.name,
                        error = %err,
                        "flush failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(FLUSH_ERROR_PAUSE) => {}
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait_for.to_std().unwrap_or_default()) => {
                    if let Err(err) = self.flush().await {
                        error!(
                            collection = %self.collection.name,
                            error = %err,
                            "flush failed"
                        );
                    }
                }
            }
        }
        debug!(collection = %self.collection.name, "flusher stopped");
    }

    /// Signals the flusher to exit. Idempotent.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    fn cached_flushed_at(&self) -> DateTime<Utc> {
        *self.flushed_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_cached_flushed_at(&self, flushed_at: DateTime<Utc>) {
        *self.flushed_at.lock().unwrap_or_else(|e| e.into_inner()) = flushed_at;
    }
}

/// Jittered back-off for flush transaction retries.
///
/// Jitter is a hash of the current time, which keeps competing instances
/// out of lockstep without a rand dependency.
fn conflict_delay(attempt: u32) -> Duration {
    let base_ms = 10u64.saturating_mul(1 << attempt.min(6));
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0) as u64;
    let hash = nanos.wrapping_mul(31).wrapping_add(u64::from(attempt) * 17);
    let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0;
    let factor = 1.0 + jitter_pct * 0.25;
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

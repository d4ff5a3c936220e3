//! Pipes: sealed batches in retry-delivery.
//!
//! A pipe is opened by the buffer's flush transaction and closed by its
//! convey loop. The sealed document list is immutable; the live state
//! (iteration counter and per-consumer progress) is kept in the store so a
//! restarting engine instance can adopt the pipe and continue delivery.
//!
//! At rest a pipe spans three keys (see [`crate::keys`]): a metadata hash,
//! the document list and a consumer hash whose values are JSON-encoded
//! [`ConsumerState`] records.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bulklog_common::{Store, StoreTx};

use crate::collection::Collection;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::keys;

const FIELD_ITERATION: &str = "iteration";
const FIELD_STARTED_AT: &str = "startedAt";
const FIELD_FLUSH_PERIOD: &str = "flushPeriod";
const FIELD_RETENTION_PERIOD: &str = "retentionPeriod";

/// Delivery progress of one consumer on one pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Whether delivery to this consumer is finished (success or recorded
    /// permanent failure).
    pub done: bool,

    /// Earliest time of the next delivery attempt.
    #[serde(rename = "nextAttemptAt")]
    pub next_attempt_at: DateTime<Utc>,

    /// Reason the consumer was retired without success, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// One sealed batch.
///
/// The struct itself is the immutable descriptor (identity and cadence,
/// copied from the collection at seal time); the mutable delivery state
/// lives behind the store operations so that several engine instances
/// observe the same progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipe {
    id: Uuid,
    collection: String,
    started_at: DateTime<Utc>,
    flush_period: Duration,
    retention_period: Duration,
}

impl Pipe {
    /// Creates the descriptor for a batch being sealed now.
    pub(crate) fn seal(collection: &Collection, id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            collection: collection.name.clone(),
            started_at,
            flush_period: collection.flush_period,
            retention_period: collection.retention_period,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn flush_period(&self) -> Duration {
        self.flush_period
    }

    pub fn retention_period(&self) -> Duration {
        self.retention_period
    }

    /// The instant this pipe stops retrying, regardless of pending
    /// consumers.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + TimeDelta::from_std(self.retention_period).unwrap_or(TimeDelta::MAX)
    }

    pub(crate) fn meta_key(&self) -> String {
        keys::pipe_key(&keys::pipe_prefix(&self.collection), self.id)
    }

    pub(crate) fn buffer_key(&self) -> String {
        keys::pipe_buffer_key(&self.meta_key())
    }

    pub(crate) fn consumers_key(&self) -> String {
        keys::pipe_consumers_key(&self.meta_key())
    }

    /// Queues this pipe's records into a flush transaction: the metadata
    /// hash and one pending state per consumer. The document list itself
    /// is drained in by the caller.
    pub(crate) fn write_new<'a>(
        &self,
        tx: &mut dyn StoreTx,
        consumer_keys: impl Iterator<Item = &'a str>,
        next_attempt_at: DateTime<Utc>,
    ) {
        let meta_key = self.meta_key();
        tx.hset(&meta_key, FIELD_ITERATION, "0");
        tx.hset(&meta_key, FIELD_STARTED_AT, &format_time(self.started_at));
        tx.hset(
            &meta_key,
            FIELD_FLUSH_PERIOD,
            &self.flush_period.as_millis().to_string(),
        );
        tx.hset(
            &meta_key,
            FIELD_RETENTION_PERIOD,
            &self.retention_period.as_millis().to_string(),
        );

        let consumers_key = self.consumers_key();
        let state = ConsumerState {
            done: false,
            next_attempt_at,
            failure: None,
        };
        let encoded = encode_state(&state);
        for key in consumer_keys {
            tx.hset(&consumers_key, key, &encoded);
        }
    }

    /// Reconstructs a pipe from its metadata hash.
    ///
    /// Returns `None` when the hash no longer exists (the pipe was retired
    /// between enumeration and load).
    pub(crate) async fn load(
        store: &dyn Store,
        collection: &str,
        id: Uuid,
    ) -> Result<Option<Self>> {
        let meta_key = keys::pipe_key(&keys::pipe_prefix(collection), id);
        let fields = store.hget_all(&meta_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let started_at = parse_time(require_field(&fields, &meta_key, FIELD_STARTED_AT)?)?;
        let flush_period = parse_millis(require_field(&fields, &meta_key, FIELD_FLUSH_PERIOD)?)?;
        let retention_period =
            parse_millis(require_field(&fields, &meta_key, FIELD_RETENTION_PERIOD)?)?;

        Ok(Some(Self {
            id,
            collection: collection.to_string(),
            started_at,
            flush_period,
            retention_period,
        }))
    }

    /// Loads the sealed batch, in append order.
    pub(crate) async fn documents(&self, store: &dyn Store) -> Result<Vec<Document>> {
        let encoded = store.get_list(&self.buffer_key()).await?;
        encoded.iter().map(|e| Document::decode(e)).collect()
    }

    pub(crate) async fn iteration(&self, store: &dyn Store) -> Result<u32> {
        match store.hget(&self.meta_key(), FIELD_ITERATION).await? {
            Some(value) => value
                .parse()
                .map_err(|_| Error::Encoding(format!("invalid iteration: {value}"))),
            None => Ok(0),
        }
    }

    pub(crate) async fn set_iteration(&self, store: &dyn Store, iteration: u32) -> Result<()> {
        store
            .hset(&self.meta_key(), FIELD_ITERATION, &iteration.to_string())
            .await?;
        Ok(())
    }

    /// All consumer states recorded on this pipe.
    pub(crate) async fn consumer_states(
        &self,
        store: &dyn Store,
    ) -> Result<HashMap<String, ConsumerState>> {
        let fields = store.hget_all(&self.consumers_key()).await?;
        fields
            .into_iter()
            .map(|(key, value)| Ok((key, decode_state(&value)?)))
            .collect()
    }

    /// Consumers still awaiting delivery, with their states.
    pub(crate) async fn pending_consumers(
        &self,
        store: &dyn Store,
    ) -> Result<Vec<(String, ConsumerState)>> {
        let states = self.consumer_states(store).await?;
        Ok(states.into_iter().filter(|(_, s)| !s.done).collect())
    }

    /// Marks a consumer finished, optionally recording why it was retired
    /// without success. Idempotent.
    pub(crate) async fn mark_consumer_done(
        &self,
        store: &dyn Store,
        consumer_key: &str,
        failure: Option<String>,
    ) -> Result<()> {
        let consumers_key = self.consumers_key();
        let next_attempt_at = match store.hget(&consumers_key, consumer_key).await? {
            Some(value) => decode_state(&value)?.next_attempt_at,
            None => self.started_at,
        };
        let state = ConsumerState {
            done: true,
            next_attempt_at,
            failure,
        };
        store
            .hset(&consumers_key, consumer_key, &encode_state(&state))
            .await?;
        Ok(())
    }

    /// Reschedules a consumer after a transient failure.
    pub(crate) async fn set_next_attempt(
        &self,
        store: &dyn Store,
        consumer_key: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let state = ConsumerState {
            done: false,
            next_attempt_at,
            failure: None,
        };
        store
            .hset(&self.consumers_key(), consumer_key, &encode_state(&state))
            .await?;
        Ok(())
    }

    /// Removes the pipe's records from the store.
    pub(crate) async fn delete(&self, store: &dyn Store) -> Result<()> {
        store
            .delete(&[self.meta_key(), self.buffer_key(), self.consumers_key()])
            .await?;
        Ok(())
    }
}

pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Encoding(format!("invalid timestamp {value}: {e}")))
}

fn parse_millis(value: &str) -> Result<Duration> {
    let millis: u64 = value
        .parse()
        .map_err(|_| Error::Encoding(format!("invalid duration: {value}")))?;
    Ok(Duration::from_millis(millis))
}

fn require_field<'a>(
    fields: &'a HashMap<String, String>,
    key: &str,
    field: &str,
) -> Result<&'a str> {
    fields
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| Error::Encoding(format!("pipe record {key} is missing {field}")))
}

fn encode_state(state: &ConsumerState) -> String {
    // ConsumerState serializes infallibly: plain fields, no maps.
    serde_json::to_string(state).unwrap_or_default()
}

fn decode_state(value: &str) -> Result<ConsumerState> {
    serde_json::from_str(value).map_err(|e| Error::Encoding(format!("invalid consumer state: {e}")))
}

//! Convey: the retry driver that carries one pipe to retirement.
//!
//! Each live pipe has exactly one convey task per engine instance. The task
//! wakes at the earliest pending attempt time, digests the batch into every
//! due consumer concurrently, reschedules transient failures on the pipe's
//! back-off schedule and retires the pipe once every consumer is done or
//! the retention period has elapsed.
//!
//! Store outages never kill the task: failed rounds are retried after a
//! short pause. Two instances may drive the same pipe after a restart;
//! that only risks extra deliveries, which the at-least-once contract
//! already allows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bulklog_common::{Clock, Store};

use crate::collection::BackoffPolicy;
use crate::consumer::{ConsumerError, ConsumerSet};
use crate::document::Document;
use crate::error::Result;
use crate::pipe::Pipe;

/// Pause before retrying after a store failure inside the loop.
const STORE_RETRY_PAUSE: Duration = Duration::from_secs(1);

pub(crate) fn spawn_convey(
    store: Arc<dyn Store>,
    pipe: Pipe,
    consumers: ConsumerSet,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        convey(store.as_ref(), &pipe, &consumers, backoff, clock.as_ref()).await;
    })
}

/// Drives `pipe` until every consumer acknowledged or retention elapsed,
/// then deletes it.
pub(crate) async fn convey(
    store: &dyn Store,
    pipe: &Pipe,
    consumers: &ConsumerSet,
    backoff: BackoffPolicy,
    clock: &dyn Clock,
) {
    debug!(
        collection = %pipe.collection(),
        pipe = %pipe.id(),
        "convey started"
    );

    let documents = load_documents(store, pipe).await;
    let deadline = pipe.deadline();

    loop {
        match convey_round(store, pipe, consumers, &documents, backoff, clock, deadline).await {
            Ok(RoundOutcome::Retired) => break,
            Ok(RoundOutcome::Continue) => {}
            Err(err) => {
                error!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    error = %err,
                    "convey round failed, retrying"
                );
                tokio::time::sleep(STORE_RETRY_PAUSE).await;
            }
        }
    }

    retire(store, pipe).await;
}

enum RoundOutcome {
    /// Keep driving the pipe.
    Continue,
    /// All consumers done, or retention elapsed.
    Retired,
}

async fn convey_round(
    store: &dyn Store,
    pipe: &Pipe,
    consumers: &ConsumerSet,
    documents: &[Document],
    backoff: BackoffPolicy,
    clock: &dyn Clock,
    deadline: DateTime<Utc>,
) -> Result<RoundOutcome> {
    let now = clock.now();

    let pending = pipe.pending_consumers(store).await?;
    if pending.is_empty() {
        debug!(
            collection = %pipe.collection(),
            pipe = %pipe.id(),
            "all consumers acknowledged"
        );
        return Ok(RoundOutcome::Retired);
    }
    if now >= deadline {
        warn!(
            collection = %pipe.collection(),
            pipe = %pipe.id(),
            pending = pending.len(),
            "retention elapsed with pending consumers"
        );
        return Ok(RoundOutcome::Retired);
    }

    // Sleep until the earliest pending attempt, never past the deadline,
    // then re-read state: another instance may have progressed the pipe.
    let earliest = pending
        .iter()
        .map(|(_, state)| state.next_attempt_at)
        .min()
        .unwrap_or(deadline);
    let wake = earliest.min(deadline);
    if wake > now {
        tokio::time::sleep((wake - now).to_std().unwrap_or_default()).await;
        return Ok(RoundOutcome::Continue);
    }

    // Every due consumer is attempted in the same wake, independently and
    // concurrently; one failure never blocks the others.
    let due: Vec<&str> = pending
        .iter()
        .filter(|(_, state)| state.next_attempt_at <= now)
        .map(|(key, _)| key.as_str())
        .collect();
    let results = join_all(due.iter().map(|&key| attempt(consumers, key, documents))).await;

    let mut rescheduled = Vec::new();
    for (key, outcome) in results {
        match outcome {
            Ok(()) => {
                info!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    consumer = %key,
                    documents = documents.len(),
                    "batch delivered"
                );
                pipe.mark_consumer_done(store, &key, None).await?;
            }
            Err(ConsumerError::Permanent(reason)) => {
                warn!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    consumer = %key,
                    reason = %reason,
                    "permanent consumer failure, giving up on it"
                );
                pipe.mark_consumer_done(store, &key, Some(reason)).await?;
            }
            Err(ConsumerError::Transient(reason)) => {
                warn!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    consumer = %key,
                    reason = %reason,
                    "transient consumer failure, rescheduling"
                );
                rescheduled.push(key);
            }
        }
    }

    if !rescheduled.is_empty() {
        let iteration = pipe.iteration(store).await? + 1;
        pipe.set_iteration(store, iteration).await?;
        let delay = backoff.delay_for(iteration, pipe.flush_period(), pipe.retention_period());
        let next_attempt_at = clock.now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        for key in rescheduled {
            pipe.set_next_attempt(store, &key, next_attempt_at).await?;
        }
    }

    Ok(RoundOutcome::Continue)
}

async fn attempt(
    consumers: &ConsumerSet,
    key: &str,
    documents: &[Document],
) -> (String, std::result::Result<(), ConsumerError>) {
    match consumers.get(key) {
        Some(consumer) => (key.to_string(), consumer.digest(documents).await),
        None => (
            key.to_string(),
            Err(ConsumerError::Permanent(
                "consumer is not registered".to_string(),
            )),
        ),
    }
}

/// Loads the sealed batch, retrying through store outages.
async fn load_documents(store: &dyn Store, pipe: &Pipe) -> Vec<Document> {
    loop {
        match pipe.documents(store).await {
            Ok(documents) => return documents,
            Err(err) => {
                error!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    error = %err,
                    "failed to load pipe documents, retrying"
                );
                tokio::time::sleep(STORE_RETRY_PAUSE).await;
            }
        }
    }
}

/// Removes the pipe's records, retrying through store outages.
async fn retire(store: &dyn Store, pipe: &Pipe) {
    loop {
        match pipe.delete(store).await {
            Ok(()) => {
                info!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    "pipe retired"
                );
                return;
            }
            Err(err) => {
                error!(
                    collection = %pipe.collection(),
                    pipe = %pipe.id(),
                    error = %err,
                    "failed to retire pipe, retrying"
                );
                tokio::time::sleep(STORE_RETRY_PAUSE).await;
            }
        }
    }
}

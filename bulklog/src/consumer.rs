//! Consumer capability: the downstream sinks a batch fans out to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::document::Document;

/// Failure modes of a delivery attempt.
///
/// Transient failures reschedule the consumer on the pipe's back-off
/// schedule; permanent failures mark it done with the reason recorded, so
/// a misconfigured sink does not loop for the whole retention window.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("transient consumer failure: {0}")]
    Transient(String),

    #[error("permanent consumer failure: {0}")]
    Permanent(String),
}

/// An external sink accepting document batches.
///
/// Delivery is at-least-once: the same batch may be digested again after a
/// crash or when two engine instances adopt the same pipe, so
/// implementations must be idempotent. The consumer set for a collection
/// is fixed at registration.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Stable identity; used as the field key in the pipe's consumer hash.
    fn key(&self) -> &str;

    /// Delivers one sealed batch.
    async fn digest(&self, documents: &[Document]) -> std::result::Result<(), ConsumerError>;
}

pub(crate) type ConsumerSet = HashMap<String, Arc<dyn Consumer>>;

pub(crate) fn consumer_set(consumers: Vec<Arc<dyn Consumer>>) -> ConsumerSet {
    consumers
        .into_iter()
        .map(|c| (c.key().to_string(), c))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Test consumer that records every batch it is handed and answers
    /// from a scripted queue of responses (empty queue = success).
    pub(crate) struct RecordingConsumer {
        key: String,
        batches: Mutex<Vec<Vec<uuid::Uuid>>>,
        responses: Mutex<VecDeque<std::result::Result<(), ConsumerError>>>,
    }

    impl RecordingConsumer {
        pub(crate) fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                batches: Mutex::new(Vec::new()),
                responses: Mutex::new(VecDeque::new()),
            })
        }

        /// Queues a response for the next digest call.
        pub(crate) fn push_response(&self, response: std::result::Result<(), ConsumerError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub(crate) fn call_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }

        pub(crate) fn batches(&self) -> Vec<Vec<uuid::Uuid>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Consumer for RecordingConsumer {
        fn key(&self) -> &str {
            &self.key
        }

        async fn digest(&self, documents: &[Document]) -> std::result::Result<(), ConsumerError> {
            self.batches
                .lock()
                .unwrap()
                .push(documents.iter().map(|d| d.id).collect());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    /// Test consumer that fails transiently on every call.
    pub(crate) struct AlwaysFailing {
        inner: Arc<RecordingConsumer>,
    }

    impl AlwaysFailing {
        pub(crate) fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: RecordingConsumer::new(key),
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.inner.call_count()
        }
    }

    #[async_trait]
    impl Consumer for AlwaysFailing {
        fn key(&self) -> &str {
            self.inner.key()
        }

        async fn digest(&self, documents: &[Document]) -> std::result::Result<(), ConsumerError> {
            let _ = self.inner.digest(documents).await;
            Err(ConsumerError::Transient("sink unavailable".to_string()))
        }
    }
}

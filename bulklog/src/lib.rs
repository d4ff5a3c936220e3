//! Bulklog - a bulk log buffering and delivery engine.
//!
//! Producers append structured JSON documents tagged with a collection and
//! a schema; the engine coalesces them into time-windowed batches and fans
//! each batch out to every registered consumer on a fixed retry schedule.
//! Delivery is at-least-once within a retention window; consumers must be
//! idempotent.
//!
//! # Architecture
//!
//! Each collection owns a buffer in the store. A flusher task wakes once
//! per flush period and seals the buffered documents into a *pipe* - an
//! immutable batch with per-consumer delivery state - inside one optimistic
//! store transaction. A *convey* task then drives the pipe: it attempts
//! every pending consumer, reschedules failures with back-off, and retires
//! the pipe once all consumers acknowledged or the retention period
//! elapsed.
//!
//! With the Redis store backend, several engine instances can share one
//! key space: the flush transaction watches the buffer and timestamp keys,
//! so exactly one instance seals each flush window, and a restarting
//! instance adopts any pipes left behind by a crashed one.
//!
//! # Key Concepts
//!
//! - **[`Engine`]**: the registry mapping collection names to buffers; owns
//!   the task lifecycle.
//! - **[`Collection`]**: per-collection cadence (flush period, retention
//!   period, back-off policy).
//! - **[`Consumer`]**: an external sink with an idempotent `digest`
//!   capability, identified by a stable string key.
//! - **[`Pipe`]**: one sealed batch in retry-delivery.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bulklog::{Collection, Document, Engine};
//! use bulklog_common::{StoreConfig, create_store};
//!
//! let store = create_store(&StoreConfig::default()).await?;
//! let engine = Engine::new(store);
//!
//! let collection = Collection::new(
//!     "audit",
//!     Duration::from_secs(5),
//!     Duration::from_secs(300),
//! )?;
//! engine.register(collection, vec![indexer, archiver]).await?;
//!
//! let doc = Document::new("audit", "v1", br#"{"event": "login"}"#)?;
//! engine.append("audit", &doc).await?;
//! ```

mod buffer;
mod collection;
mod consumer;
mod convey;
mod document;
mod engine;
mod error;
mod keys;
mod pipe;
mod serde;

pub use collection::{BackoffPolicy, Collection, DEFAULT_MAX_TX_RETRIES};
pub use consumer::{Consumer, ConsumerError};
pub use document::Document;
pub use engine::Engine;
pub use error::{Error, Result};
pub use pipe::{ConsumerState, Pipe};

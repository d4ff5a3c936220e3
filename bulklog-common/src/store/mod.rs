//! Transactional key/value store adapter.
//!
//! The engine persists buffer lists, flush timestamps and pipe records
//! through one trait pair with two interchangeable backends:
//!
//! - [`memory::MemoryStore`]: single-process, a mutex around the whole key
//!   space with per-key versions emulating optimistic watches.
//! - [`redis::RedisStore`]: shared deployment, Redis `WATCH`/`MULTI`/`EXEC`
//!   optimistic transactions so multiple engine instances can cooperate
//!   without sealing overlapping pipes.
//!
//! A transaction is optimistic: [`Store::begin`] declares the watch set,
//! reads execute inside the watch window, writes are queued and applied
//! atomically by [`StoreTx::commit`]. Commit reports `false` when any
//! watched key changed since `begin`; the caller retries the whole
//! transaction.

pub mod config;
pub mod factory;
pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

pub use config::{RedisStoreConfig, StoreConfig};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store backends.
///
/// Every variant is treated as transient by the engine: flush transactions
/// retry up to their configured bound and background loops retry with a
/// capped pause.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("wrong value type at key {key}")]
    WrongType { key: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Plain (non-transactional) store operations.
///
/// Single operations are atomic in both backends. Multi-key updates that
/// must be atomic go through [`Store::begin`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends a value to the tail of the list at `key`, creating it if
    /// absent.
    async fn append_list(&self, key: &str, value: Bytes) -> StoreResult<()>;

    /// Returns the length of the list at `key`; 0 if absent.
    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    /// Returns the full contents of the list at `key`, in append order.
    async fn get_list(&self, key: &str) -> StoreResult<Vec<Bytes>>;

    async fn get_str(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_str(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Returns all fields of the hash at `key`; empty if absent.
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Returns every key starting with `prefix`.
    async fn enumerate(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Removes the given keys; missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Opens an optimistic transaction watching the given keys.
    async fn begin(&self, watch: Vec<String>) -> StoreResult<Box<dyn StoreTx>>;
}

/// One optimistic transaction.
///
/// Reads run immediately, inside the watch window opened by
/// [`Store::begin`]. Writes are queued and applied atomically on
/// [`StoreTx::commit`]. Dropping a transaction without committing discards
/// the queued writes.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_str(&mut self, key: &str) -> StoreResult<Option<String>>;

    async fn list_len(&mut self, key: &str) -> StoreResult<u64>;

    /// Queues an append to the list at `key`.
    fn append_list(&mut self, key: &str, value: Bytes);

    /// Queues a wholesale move of the list at `src` to `dst` (rename
    /// semantics: `dst` is replaced, `src` removed, order preserved).
    fn drain_list_into(&mut self, src: &str, dst: &str);

    fn set_str(&mut self, key: &str, value: &str);

    fn hset(&mut self, key: &str, field: &str, value: &str);

    fn delete(&mut self, key: &str);

    /// Applies the queued writes. Returns `false` when a watched key was
    /// modified since `begin`, in which case nothing was applied.
    async fn commit(self: Box<Self>) -> StoreResult<bool>;
}

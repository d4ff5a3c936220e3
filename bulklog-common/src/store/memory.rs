//! In-memory store backend.
//!
//! A single mutex guards the whole key space, which makes every plain
//! operation trivially atomic. Optimistic transactions are emulated with a
//! per-key version counter: `begin` snapshots the versions of the watched
//! keys and `commit` re-checks them under the same mutex before applying
//! the queued writes.
//!
//! Cloning a `MemoryStore` shares the underlying state, so two engine
//! instances handed clones of the same store observe each other exactly
//! like two processes sharing one Redis. A process restart loses all state;
//! that trade-off is inherent to this backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Store, StoreError, StoreResult, StoreTx};

#[derive(Debug, Clone)]
enum Entry {
    List(Vec<Bytes>),
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
}

impl MemoryInner {
    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn list_len(&self, key: &str) -> StoreResult<u64> {
        match self.data.get(key) {
            Some(Entry::List(items)) => Ok(items.len() as u64),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(0),
        }
    }

    fn get_str(&self, key: &str) -> StoreResult<Option<String>> {
        match self.data.get(key) {
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn apply(&mut self, op: Op) -> StoreResult<()> {
        match op {
            Op::AppendList { key, value } => {
                match self
                    .data
                    .entry(key.clone())
                    .or_insert_with(|| Entry::List(Vec::new()))
                {
                    Entry::List(items) => items.push(value),
                    _ => return Err(StoreError::WrongType { key }),
                }
                self.touch_owned(key);
            }
            Op::DrainListInto { src, dst } => {
                if let Some(entry) = self.data.remove(&src) {
                    self.data.insert(dst.clone(), entry);
                    self.touch(&src);
                    self.touch_owned(dst);
                }
            }
            Op::SetStr { key, value } => {
                self.data.insert(key.clone(), Entry::Str(value));
                self.touch_owned(key);
            }
            Op::HSet { key, field, value } => {
                match self
                    .data
                    .entry(key.clone())
                    .or_insert_with(|| Entry::Hash(HashMap::new()))
                {
                    Entry::Hash(fields) => {
                        fields.insert(field, value);
                    }
                    _ => return Err(StoreError::WrongType { key }),
                }
                self.touch_owned(key);
            }
            Op::Delete { key } => {
                if self.data.remove(&key).is_some() {
                    self.touch_owned(key);
                }
            }
        }
        Ok(())
    }

    fn touch_owned(&mut self, key: String) {
        *self.versions.entry(key).or_insert(0) += 1;
    }
}

#[derive(Debug)]
enum Op {
    AppendList { key: String, value: Bytes },
    DrainListInto { src: String, dst: String },
    SetStr { key: String, value: String },
    HSet { key: String, field: String, value: String },
    Delete { key: String },
}

/// Single-process store backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        // A poisoned mutex means another thread panicked mid-operation;
        // the state is still a consistent snapshot for a key/value map.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_list(&self, key: &str, value: Bytes) -> StoreResult<()> {
        self.lock().apply(Op::AppendList {
            key: key.to_string(),
            value,
        })
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        self.lock().list_len(key)
    }

    async fn get_list(&self, key: &str) -> StoreResult<Vec<Bytes>> {
        let inner = self.lock();
        match inner.data.get(key) {
            Some(Entry::List(items)) => Ok(items.clone()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn get_str(&self, key: &str) -> StoreResult<Option<String>> {
        self.lock().get_str(key)
    }

    async fn set_str(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock().apply(Op::SetStr {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let inner = self.lock();
        match inner.data.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.lock().apply(Op::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let inner = self.lock();
        match inner.data.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn enumerate(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let mut inner = self.lock();
        for key in keys {
            inner.apply(Op::Delete { key: key.clone() })?;
        }
        Ok(())
    }

    async fn begin(&self, watch: Vec<String>) -> StoreResult<Box<dyn StoreTx>> {
        let watched = {
            let inner = self.lock();
            watch
                .into_iter()
                .map(|key| {
                    let version = inner.version(&key);
                    (key, version)
                })
                .collect()
        };
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            watched,
            ops: Vec::new(),
        }))
    }
}

struct MemoryTx {
    inner: Arc<Mutex<MemoryInner>>,
    watched: Vec<(String, u64)>,
    ops: Vec<Op>,
}

impl MemoryTx {
    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_str(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.lock().get_str(key)
    }

    async fn list_len(&mut self, key: &str) -> StoreResult<u64> {
        self.lock().list_len(key)
    }

    fn append_list(&mut self, key: &str, value: Bytes) {
        self.ops.push(Op::AppendList {
            key: key.to_string(),
            value,
        });
    }

    fn drain_list_into(&mut self, src: &str, dst: &str) {
        self.ops.push(Op::DrainListInto {
            src: src.to_string(),
            dst: dst.to_string(),
        });
    }

    fn set_str(&mut self, key: &str, value: &str) {
        self.ops.push(Op::SetStr {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.ops.push(Op::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
    }

    fn delete(&mut self, key: &str) {
        self.ops.push(Op::Delete {
            key: key.to_string(),
        });
    }

    async fn commit(self: Box<Self>) -> StoreResult<bool> {
        let MemoryTx {
            inner,
            watched,
            ops,
        } = *self;
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        for (key, version) in &watched {
            if inner.version(key) != *version {
                return Ok(false);
            }
        }
        for op in ops {
            inner.apply(op)?;
        }
        Ok(true)
    }
}

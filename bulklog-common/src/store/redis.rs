//! Redis store backend.
//!
//! Plain operations go through a shared [`ConnectionManager`]. Optimistic
//! transactions need connection-local `WATCH` state, so each transaction
//! opens a dedicated connection: `begin` issues `WATCH`, reads run on that
//! connection, writes queue into an atomic pipeline and `commit` executes
//! it. Redis replies nil to `EXEC` when a watched key changed; that maps to
//! a `false` commit. Dropping the transaction drops the connection, which
//! discards the watch.
//!
//! `drain_list_into` is a `RENAME`: it moves the source list wholesale,
//! preserving order, and never runs against a missing source because the
//! caller only drains after observing a non-zero length under watch.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use tracing::info;

use super::config::RedisStoreConfig;
use super::{Store, StoreError, StoreResult, StoreTx};

/// Shared-KV store backend.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to the configured Redis endpoint.
    pub async fn connect(config: &RedisStoreConfig) -> StoreResult<Self> {
        let url = config.url();
        let client =
            Client::open(url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(endpoint = %config.endpoint, db = config.db, "connected to redis");

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn append_list(&self, key: &str, value: Bytes) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, &value[..]).await?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn get_list(&self, key: &str) -> StoreResult<Vec<Bytes>> {
        let mut conn = self.conn.clone();
        let values: Vec<Vec<u8>> = conn.lrange(key, 0, -1).await?;
        Ok(values.into_iter().map(Bytes::from).collect())
    }

    async fn get_str(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_str(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn enumerate(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");

        // Cursor-based SCAN so enumeration never blocks the server.
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys.to_vec()).await?;
        Ok(())
    }

    async fn begin(&self, watch: Vec<String>) -> StoreResult<Box<dyn StoreTx>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        if !watch.is_empty() {
            let mut cmd = redis::cmd("WATCH");
            for key in &watch {
                cmd.arg(key);
            }
            cmd.query_async::<_, ()>(&mut conn).await?;
        }

        let mut pipe = redis::pipe();
        pipe.atomic();

        Ok(Box::new(RedisTx { conn, pipe }))
    }
}

struct RedisTx {
    conn: MultiplexedConnection,
    pipe: redis::Pipeline,
}

#[async_trait]
impl StoreTx for RedisTx {
    async fn get_str(&mut self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = self.conn.get(key).await?;
        Ok(value)
    }

    async fn list_len(&mut self, key: &str) -> StoreResult<u64> {
        let len: u64 = self.conn.llen(key).await?;
        Ok(len)
    }

    fn append_list(&mut self, key: &str, value: Bytes) {
        self.pipe.rpush(key, &value[..]).ignore();
    }

    fn drain_list_into(&mut self, src: &str, dst: &str) {
        self.pipe.cmd("RENAME").arg(src).arg(dst).ignore();
    }

    fn set_str(&mut self, key: &str, value: &str) {
        self.pipe.set(key, value).ignore();
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.pipe.hset(key, field, value).ignore();
    }

    fn delete(&mut self, key: &str) {
        self.pipe.del(key).ignore();
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<bool> {
        let reply: Option<redis::Value> = self.pipe.query_async(&mut self.conn).await?;
        Ok(reply.is_some())
    }
}

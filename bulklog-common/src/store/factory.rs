//! Store factory for creating backends from configuration.

use std::sync::Arc;

use super::config::StoreConfig;
use super::memory::MemoryStore;
use super::redis::RedisStore;
use super::{Store, StoreResult};

/// Creates a store instance for the configured backend.
///
/// # Examples
///
/// ```rust,ignore
/// use bulklog_common::store::{StoreConfig, factory::create_store};
///
/// // In-memory store (default)
/// let store = create_store(&StoreConfig::default()).await?;
///
/// // Shared Redis store
/// let config = StoreConfig::Redis(RedisStoreConfig {
///     endpoint: "localhost:6379".to_string(),
///     password: String::new(),
///     db: 0,
/// });
/// let store = create_store(&config).await?;
/// ```
pub async fn create_store(config: &StoreConfig) -> StoreResult<Arc<dyn Store>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Redis(redis_config) => {
            let store = RedisStore::connect(redis_config).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_create_memory_store_from_default_config() {
        // given
        let config = StoreConfig::default();

        // when
        let store = create_store(&config).await.unwrap();

        // then
        store.set_str("k", "v").await.unwrap();
        assert_eq!(store.get_str("k").await.unwrap(), Some("v".to_string()));
    }
}

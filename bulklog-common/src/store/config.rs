//! Store backend configuration.
//!
//! Services pick the backend through a tagged configuration value, which
//! deserializes from YAML/JSON config files.

use serde::{Deserialize, Serialize};

/// Top-level store selection.
///
/// Defaults to the in-memory backend, which is all a single-process
/// deployment needs. Shared deployments point several engine instances at
/// one Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type")]
pub enum StoreConfig {
    #[default]
    Memory,
    Redis(RedisStoreConfig),
}

/// Redis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisStoreConfig {
    /// Host and port, e.g. `localhost:6379`.
    pub endpoint: String,

    /// Password; empty for unauthenticated servers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    /// Database index.
    #[serde(default)]
    pub db: i64,
}

impl RedisStoreConfig {
    /// Builds the connection URL for the redis client.
    pub(crate) fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.endpoint, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.endpoint, self.db)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_memory() {
        assert_eq!(StoreConfig::default(), StoreConfig::Memory);
    }

    #[test]
    fn should_deserialize_memory_config() {
        // given
        let yaml = r#"type: Memory"#;

        // when
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();

        // then
        assert_eq!(config, StoreConfig::Memory);
    }

    #[test]
    fn should_deserialize_redis_config() {
        // given
        let yaml = r#"
type: Redis
endpoint: redis.internal:6379
password: hunter2
db: 3
"#;

        // when
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();

        // then
        assert_eq!(
            config,
            StoreConfig::Redis(RedisStoreConfig {
                endpoint: "redis.internal:6379".to_string(),
                password: "hunter2".to_string(),
                db: 3,
            })
        );
    }

    #[test]
    fn should_default_password_and_db() {
        // given
        let yaml = r#"
type: Redis
endpoint: localhost:6379
"#;

        // when
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();

        // then
        match config {
            StoreConfig::Redis(redis_config) => {
                assert!(redis_config.password.is_empty());
                assert_eq!(redis_config.db, 0);
            }
            _ => panic!("expected Redis config"),
        }
    }

    #[test]
    fn should_omit_empty_password_when_serializing() {
        // given
        let config = StoreConfig::Redis(RedisStoreConfig {
            endpoint: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
        });

        // when
        let yaml = serde_yaml::to_string(&config).unwrap();

        // then
        assert!(yaml.contains("type: Redis"));
        assert!(!yaml.contains("password"));
    }

    #[test]
    fn should_build_url_with_and_without_password() {
        // given
        let plain = RedisStoreConfig {
            endpoint: "localhost:6379".to_string(),
            password: String::new(),
            db: 1,
        };
        let authed = RedisStoreConfig {
            endpoint: "localhost:6379".to_string(),
            password: "s3cret".to_string(),
            db: 0,
        };

        // then
        assert_eq!(plain.url(), "redis://localhost:6379/1");
        assert_eq!(authed.url(), "redis://:s3cret@localhost:6379/0");
    }
}

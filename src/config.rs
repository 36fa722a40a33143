//! Configuration parsing.

use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Default key prefix for all queue namespaces.
pub const DEFAULT_PREFIX: &str = "gantry";

/// Crate-wide configuration, typically read from a `.toml` file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Configuration for connecting to Redis.
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Config {
    /// Read configuration from a file into a new Config struct.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) => return Err(err.to_string()),
        };

        match toml::from_str(&data) {
            Ok(conf) => Ok(conf),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Get the Redis URL to use for connecting to a Redis server.
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Key prefix under which all queues of this deployment live.
    pub fn key_prefix(&self) -> &str {
        &self.redis.key_prefix
    }
}

/// Configuration for connecting to Redis.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL to connect to. Defaults to "redis://127.0.0.1".
    pub url: String,

    /// Prefix added to all queue keys. Avoids key collisions when the Redis
    /// server is shared with other applications.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1".to_owned(),
            key_prefix: DEFAULT_PREFIX.to_owned(),
        }
    }
}

//! Configuration module for Stratus.
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::ReadThroughConfig;
use crate::error::ConfigError;
use crate::keyed::StoreConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    // MongoDB
    pub mongodb_uri: String,
    pub mongodb_database: String,

    // Redis
    pub redis_url: Option<String>,

    /// Collections with a change listener (comma-separated).
    pub watched_collections: Vec<String>,

    // Cache tunables
    pub key_prefix: String,
    pub object_ttl: Duration,
    pub query_ttl: Duration,
    pub event_marker_ttl: Duration,
    pub collection_size_ttl: Duration,
    pub store_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let watched_collections = var("WATCHED_COLLECTIONS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            mongodb_uri: var("MONGODB_URI").ok_or(ConfigError::Missing("MONGODB_URI"))?,
            mongodb_database: var("MONGODB_DATABASE").unwrap_or_else(|| "stratus".to_string()),
            redis_url: var("REDIS_URL"),
            watched_collections,
            key_prefix: var("CACHE_KEY_PREFIX").unwrap_or_else(|| "stratus".to_string()),
            object_ttl: Duration::from_secs(parse(&var, "OBJECT_TTL_SECS", 3600)?),
            query_ttl: Duration::from_secs(parse(&var, "QUERY_TTL_SECS", 600)?),
            event_marker_ttl: Duration::from_secs(parse(&var, "EVENT_MARKER_TTL_SECS", 300)?),
            collection_size_ttl: Duration::from_secs(
                parse(&var, "COLLECTION_SIZE_TTL_MINUTES", 5u64)?.saturating_mul(60),
            ),
            store_timeout: Duration::from_millis(parse(&var, "CACHE_TIMEOUT_MS", 250)?),
        })
    }

    /// Keyed store settings derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default()
            .key_prefix(self.key_prefix.clone())
            .object_ttl(self.object_ttl)
            .query_ttl(self.query_ttl)
            .marker_ttl(self.event_marker_ttl)
    }

    pub fn read_through_config(&self) -> ReadThroughConfig {
        ReadThroughConfig::default()
            .store_timeout(self.store_timeout)
            .collection_size_ttl(self.collection_size_ttl)
    }
}

fn parse<T: FromStr>(
    var: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            expected: "a non-negative integer",
        }),
    }
}

//! Keyed store configuration.

use std::time::Duration;

/// Tunables shared by the keyed store implementations.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefix of every key written to the store.
    pub key_prefix: String,

    /// Maximum number of entries per table (in-process store only).
    pub max_capacity: u64,

    /// Time-to-live for object cache entries.
    pub object_ttl: Duration,

    /// Time-to-live for query cache entries and their common-index groups.
    pub query_ttl: Duration,

    /// How long a processed change event is remembered.
    pub marker_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "stratus".to_string(),
            max_capacity: 10_000,
            object_ttl: Duration::from_secs(3600), // 1 hour
            query_ttl: Duration::from_secs(600),   // 10 minutes
            marker_ttl: Duration::from_secs(300),  // 5 minutes
        }
    }
}

impl StoreConfig {
    /// Set the key prefix (builder pattern).
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set max capacity per table.
    #[must_use]
    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    #[must_use]
    pub fn object_ttl(mut self, ttl: Duration) -> Self {
        self.object_ttl = ttl;
        self
    }

    #[must_use]
    pub fn query_ttl(mut self, ttl: Duration) -> Self {
        self.query_ttl = ttl;
        self
    }

    #[must_use]
    pub fn marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }

    /// Config for collections whose documents change often.
    /// Short object TTL, queries kept a little longer.
    pub fn hot_data() -> Self {
        Self {
            object_ttl: Duration::from_secs(60),  // 1 minute
            query_ttl: Duration::from_secs(120), // 2 minutes
            ..Default::default()
        }
    }
}

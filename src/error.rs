//! Error types shared across the cache core.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by an object store (the source of truth).
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("failed to decode document: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    #[error("invalid document id `{0}`")]
    InvalidId(String),

    /// The resume point of a change feed has fallen out of the store's history.
    /// Cache coherence for the collection can no longer be guaranteed.
    #[error("change feed history for `{collection}` is no longer available")]
    HistoryLost { collection: String },

    #[error("change feed for `{collection}` was interrupted")]
    FeedInterrupted { collection: String },
}

impl ObjectStoreError {
    /// Whether a change feed that hit this error can be resumed.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::HistoryLost { .. })
    }
}

/// Errors raised by the keyed store.
#[derive(Debug, Error)]
pub enum KeyedStoreError {
    #[error("keyed store unavailable: {0}")]
    Unavailable(String),

    #[error("keyed store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with a reply of the wrong shape or type.
    #[error("malformed keyed store reply: {0}")]
    Protocol(String),
}

impl KeyedStoreError {
    /// Transient errors are recovered by falling through to the object store.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

impl From<redis::RedisError> for KeyedStoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::TypeError => Self::Protocol(err.to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Errors surfaced to callers of the read-through cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("failed to decode document: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    #[error("query is not serializable: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// Missing or malformed environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value `{value}`: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Final outcome of a change listener that did not stop cleanly.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The change feed failed in a way that cannot be resumed.
    #[error("change listener failed: {0}")]
    Feed(#[from] ObjectStoreError),

    #[error("change listener task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

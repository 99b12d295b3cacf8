//! Keyed store: the shared in-memory store that holds the normalized cache.
//!
//! Per collection the store keeps:
//! - an object table (document id -> latest known JSON)
//! - a query index (fingerprint -> ordered id list)
//! - common-index groups (label -> fingerprints tagged with it)
//! - idempotency markers for processed change events
//! - collection-size counters with a short expiry
//!
//! Every multi-key operation is one atomic procedure in the store, so
//! concurrent readers never observe a half-written object/query pair.
//!
//! - `RedisKeyedStore` - Lua scripts on a Redis server, shared by the fleet
//! - `MemoryKeyedStore` - Moka tables behind a per-collection lock

mod codec;
mod config;
mod memory;
mod redis_store;
mod scripts;
mod typed;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use codec::{decode_document, encode_document};
pub use config::StoreConfig;
pub use memory::MemoryKeyedStore;
pub use redis_store::{KeyLayout, RedisKeyedStore};
pub use typed::TypedCache;

use crate::database::DocumentId;
use crate::error::KeyedStoreError;
use crate::fingerprint::Fingerprint;

/// A document as held in the object table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    pub id: DocumentId,
    pub json: String,
}

/// A query cache entry together with the state of the objects it references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedQuery {
    /// Full result membership, in result order.
    pub ids: Vec<DocumentId>,
    /// Objects currently present in the object table, in result order.
    pub hits: Vec<CachedObject>,
    /// Ids whose objects are absent.
    pub missing: Vec<DocumentId>,
    /// When the id list was last (re)established.
    pub created_at: DateTime<Utc>,
}

/// Outcome of a query lookup. Absence is an ordinary state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryLookup {
    Miss,
    Hit(CachedQuery),
}

/// What a `set` call is doing to the query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// (Re)establish the whole result set: the id list is replaced.
    Establish,
    /// Refill gaps after a partial hit: the id list is left untouched.
    Refill,
}

/// One change to apply to the object table.
#[derive(Debug, Clone, Copy)]
pub struct Invalidation<'a> {
    /// Marker guarding against redelivered events. `None` always applies.
    pub idempotency_key: Option<&'a str>,
    pub collection: &'a str,
    pub document_id: &'a DocumentId,
    /// Group whose query entries are dropped as well.
    pub common_index: Option<&'a str>,
    /// New JSON of the document, or `None` when it was deleted.
    pub document_json: Option<&'a str>,
}

/// The atomic procedures of the keyed store.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Look up a query entry and partition its ids into present and missing.
    async fn get(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<QueryLookup, KeyedStoreError>;

    /// Write objects, and in `Establish` mode the query entry listing them.
    /// Tags the fingerprint with `common_index` if given. Objects that are
    /// already cached, or were deleted recently, are left as they are.
    /// Returns the number of objects written.
    async fn set(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        common_index: Option<&str>,
        objects: &[CachedObject],
        mode: WriteMode,
    ) -> Result<u64, KeyedStoreError>;

    /// Apply a document change. Returns the number of entries affected,
    /// zero if the idempotency key was already processed.
    async fn invalidate(&self, invalidation: Invalidation<'_>) -> Result<u64, KeyedStoreError>;

    /// Drop every query entry tagged with `common_index`.
    async fn invalidate_group(
        &self,
        collection: &str,
        common_index: &str,
    ) -> Result<u64, KeyedStoreError>;

    /// Read a collection-size counter.
    async fn get_count(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<u64>, KeyedStoreError>;

    /// Store a collection-size counter that expires after `ttl`.
    async fn set_count(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        count: u64,
        ttl: Duration,
    ) -> Result<(), KeyedStoreError>;
}

//! Redis keyed store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{CachedObject, CachedQuery, Invalidation, KeyedStore, QueryLookup, StoreConfig, WriteMode, scripts};
use crate::database::DocumentId;
use crate::error::KeyedStoreError;
use crate::fingerprint::Fingerprint;

/// Key families of one store, all under a common prefix.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn query_prefix(&self, collection: &str) -> String {
        format!("{}:{}:query:", self.prefix, collection)
    }

    pub fn query(&self, collection: &str, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.query_prefix(collection), fingerprint)
    }

    pub fn object_prefix(&self, collection: &str) -> String {
        format!("{}:{}:obj:", self.prefix, collection)
    }

    pub fn object(&self, collection: &str, id: &DocumentId) -> String {
        format!("{}{}", self.object_prefix(collection), id)
    }

    pub fn group(&self, collection: &str, common_index: &str) -> String {
        format!("{}:{}:group:{}", self.prefix, collection, common_index)
    }

    pub fn event(&self, collection: &str, idempotency_key: &str) -> String {
        format!("{}:{}:event:{}", self.prefix, collection, idempotency_key)
    }

    pub fn count(&self, collection: &str, fingerprint: &Fingerprint) -> String {
        format!("{}:{}:count:{}", self.prefix, collection, fingerprint)
    }
}

/// Query entry as stored under a query key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredQuery {
    ids: Vec<String>,
    /// Milliseconds since the Unix epoch.
    created_at: i64,
}

struct Scripts {
    get: Script,
    set: Script,
    invalidate: Script,
    invalidate_group: Script,
}

/// Keyed store shared by every process through a Redis server.
#[derive(Clone)]
pub struct RedisKeyedStore {
    conn: ConnectionManager,
    keys: KeyLayout,
    config: StoreConfig,
    scripts: Arc<Scripts>,
}

impl RedisKeyedStore {
    /// Connect to Redis. The connection reconnects on its own afterwards.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, config: StoreConfig) -> Result<Self, KeyedStoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Successfully connected to Redis");

        Ok(Self {
            conn,
            keys: KeyLayout::new(config.key_prefix.clone()),
            config,
            scripts: Arc::new(Scripts {
                get: Script::new(scripts::GET),
                set: Script::new(scripts::SET),
                invalidate: Script::new(scripts::INVALIDATE),
                invalidate_group: Script::new(scripts::INVALIDATE_GROUP),
            }),
        })
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }
}

impl std::fmt::Debug for RedisKeyedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyedStore")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl KeyedStore for RedisKeyedStore {
    async fn get(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<QueryLookup, KeyedStoreError> {
        let mut conn = self.conn.clone();
        let reply: Value = self
            .scripts
            .get
            .key(self.keys.query(collection, fingerprint))
            .arg(self.keys.object_prefix(collection))
            .invoke_async(&mut conn)
            .await?;
        parse_lookup(reply)
    }

    async fn set(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        common_index: Option<&str>,
        objects: &[CachedObject],
        mode: WriteMode,
    ) -> Result<u64, KeyedStoreError> {
        let entry = StoredQuery {
            ids: objects.iter().map(|object| object.id.as_str().to_string()).collect(),
            created_at: Utc::now().timestamp_millis(),
        };
        let entry = serde_json::to_string(&entry)
            .map_err(|err| KeyedStoreError::Protocol(format!("query entry: {}", err)))?;
        let mode = match mode {
            WriteMode::Establish => "establish",
            WriteMode::Refill => "refill",
        };

        let mut invocation = self.scripts.set.prepare_invoke();
        invocation
            .key(self.keys.query(collection, fingerprint))
            .key(self.keys.group(collection, common_index.unwrap_or_default()))
            .arg(self.keys.object_prefix(collection))
            .arg(ttl_secs(self.config.object_ttl))
            .arg(ttl_secs(self.config.query_ttl))
            .arg(mode)
            .arg(entry)
            .arg(fingerprint.as_str())
            .arg(flag(common_index.is_some()));
        for object in objects {
            invocation.arg(object.id.as_str()).arg(object.json.as_str());
        }

        let mut conn = self.conn.clone();
        let written: u64 = invocation.invoke_async(&mut conn).await?;
        debug!("Redis set {} objects for {} ({})", written, fingerprint, mode);
        Ok(written)
    }

    async fn invalidate(&self, invalidation: Invalidation<'_>) -> Result<u64, KeyedStoreError> {
        let collection = invalidation.collection;
        let mut conn = self.conn.clone();
        let affected: u64 = self
            .scripts
            .invalidate
            .key(self.keys.event(collection, invalidation.idempotency_key.unwrap_or_default()))
            .key(self.keys.object(collection, invalidation.document_id))
            .key(self.keys.group(collection, invalidation.common_index.unwrap_or_default()))
            .arg(ttl_secs(self.config.marker_ttl))
            .arg(ttl_secs(self.config.object_ttl))
            .arg(invalidation.document_json.unwrap_or_default())
            .arg(flag(invalidation.common_index.is_some()))
            .arg(self.keys.query_prefix(collection))
            .arg(flag(invalidation.idempotency_key.is_some()))
            .invoke_async(&mut conn)
            .await?;
        Ok(affected)
    }

    async fn invalidate_group(
        &self,
        collection: &str,
        common_index: &str,
    ) -> Result<u64, KeyedStoreError> {
        let mut conn = self.conn.clone();
        let affected: u64 = self
            .scripts
            .invalidate_group
            .key(self.keys.group(collection, common_index))
            .arg(self.keys.query_prefix(collection))
            .invoke_async(&mut conn)
            .await?;
        Ok(affected)
    }

    async fn get_count(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<u64>, KeyedStoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(self.keys.count(collection, fingerprint))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn set_count(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        count: u64,
        ttl: Duration,
    ) -> Result<(), KeyedStoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.keys.count(collection, fingerprint))
            .arg(count)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn flag(set: bool) -> &'static str {
    if set { "1" } else { "0" }
}

/// Redis expiries are whole seconds and must be positive.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn protocol(message: impl Into<String>) -> KeyedStoreError {
    KeyedStoreError::Protocol(message.into())
}

fn parse_lookup(reply: Value) -> Result<QueryLookup, KeyedStoreError> {
    let parts = match reply {
        Value::Nil => return Ok(QueryLookup::Miss),
        Value::Array(parts) => parts,
        other => return Err(protocol(format!("get returned {:?}", other))),
    };
    let [entry, hits, missing]: [Value; 3] = parts
        .try_into()
        .map_err(|parts: Vec<Value>| protocol(format!("get returned {} parts, expected 3", parts.len())))?;

    let entry: StoredQuery = serde_json::from_str(&string(entry)?)
        .map_err(|err| protocol(format!("query entry: {}", err)))?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(entry.created_at)
        .ok_or_else(|| protocol(format!("query entry timestamp {}", entry.created_at)))?;

    let hits = strings(hits)?;
    if hits.len() % 2 != 0 {
        return Err(protocol("hit list has an odd number of elements"));
    }
    let hits = hits
        .chunks_exact(2)
        .map(|pair| CachedObject {
            id: DocumentId::from_key(pair[0].clone()),
            json: pair[1].clone(),
        })
        .collect();

    Ok(QueryLookup::Hit(CachedQuery {
        ids: entry.ids.into_iter().map(DocumentId::from_key).collect(),
        hits,
        missing: strings(missing)?.into_iter().map(DocumentId::from_key).collect(),
        created_at,
    }))
}

fn string(value: Value) -> Result<String, KeyedStoreError> {
    match value {
        Value::BulkString(bytes) => {
            String::from_utf8(bytes).map_err(|_| protocol("reply is not valid UTF-8"))
        }
        Value::SimpleString(text) => Ok(text),
        other => Err(protocol(format!("expected a string, got {:?}", other))),
    }
}

fn strings(value: Value) -> Result<Vec<String>, KeyedStoreError> {
    match value {
        Value::Array(items) => items.into_iter().map(string).collect(),
        other => Err(protocol(format!("expected an array, got {:?}", other))),
    }
}

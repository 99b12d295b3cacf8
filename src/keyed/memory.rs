//! In-process keyed store.
//!
//! Tables are Moka caches, so entries expire and get evicted just like in a
//! shared store. A per-collection mutex is held for the whole of every
//! procedure, which makes each one atomic with respect to the others.
//!
//! Write-back only fills absent objects. Objects that are present are kept
//! current by `invalidate`, and deleted ids leave a short-lived tombstone,
//! so a read that fetched a document before a change was processed cannot
//! put the old version back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{CachedObject, CachedQuery, Invalidation, KeyedStore, QueryLookup, StoreConfig, TypedCache, WriteMode};
use crate::database::DocumentId;
use crate::error::KeyedStoreError;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone)]
struct QueryEntry {
    ids: Vec<DocumentId>,
    created_at: DateTime<Utc>,
}

struct CollectionTables {
    /// Held for the whole of every procedure.
    lock: Mutex<()>,
    objects: TypedCache<DocumentId, String>,
    /// Ids deleted recently; write-back must not resurrect them.
    tombstones: TypedCache<DocumentId, ()>,
    queries: TypedCache<Fingerprint, QueryEntry>,
    /// Common-index groups. Each tag refreshes the group's expiry.
    groups: TypedCache<String, HashSet<Fingerprint>>,
    markers: TypedCache<String, ()>,
    counts: TypedCache<Fingerprint, (u64, Instant)>,
}

impl CollectionTables {
    fn new(collection: &str, config: &StoreConfig) -> Self {
        Self {
            lock: Mutex::new(()),
            objects: TypedCache::new(
                format!("{}:objects", collection),
                config.max_capacity,
                Some(config.object_ttl),
            ),
            tombstones: TypedCache::new(
                format!("{}:tombstones", collection),
                config.max_capacity,
                Some(config.marker_ttl),
            ),
            queries: TypedCache::new(
                format!("{}:queries", collection),
                config.max_capacity,
                Some(config.query_ttl),
            ),
            groups: TypedCache::new(
                format!("{}:groups", collection),
                config.max_capacity,
                Some(config.query_ttl),
            ),
            markers: TypedCache::new(
                format!("{}:markers", collection),
                config.max_capacity,
                Some(config.marker_ttl),
            ),
            counts: TypedCache::new(format!("{}:counts", collection), config.max_capacity, None),
        }
    }

    fn drop_group(&self, common_index: &str) -> u64 {
        let key = common_index.to_string();
        let Some(fingerprints) = self.groups.get(&key) else {
            return 0;
        };
        self.groups.remove(&key);
        fingerprints
            .iter()
            .filter(|fingerprint| self.queries.remove(fingerprint))
            .count() as u64
    }

    /// Add a fingerprint to a group, forgetting members whose entry is gone.
    fn tag(&self, common_index: &str, fingerprint: &Fingerprint) {
        let key = common_index.to_string();
        let mut members = self.groups.get(&key).unwrap_or_default();
        members.retain(|member| self.queries.contains(member));
        members.insert(fingerprint.clone());
        self.groups.insert(key, members);
    }
}

/// Keyed store living inside this process.
#[derive(Clone)]
pub struct MemoryKeyedStore {
    config: StoreConfig,
    tables: Arc<DashMap<String, Arc<CollectionTables>>>,
}

impl MemoryKeyedStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            tables: Arc::new(DashMap::new()),
        }
    }

    fn tables(&self, collection: &str) -> Arc<CollectionTables> {
        self.tables
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(CollectionTables::new(collection, &self.config)))
            .clone()
    }

    /// Drop one object as if the store had evicted it.
    pub fn evict_object(&self, collection: &str, id: &DocumentId) -> bool {
        let tables = self.tables(collection);
        let _guard = tables.lock.lock();
        tables.objects.remove(id)
    }

    /// Drop one query entry as if the store had evicted it.
    pub fn evict_query(&self, collection: &str, fingerprint: &Fingerprint) -> bool {
        let tables = self.tables(collection);
        let _guard = tables.lock.lock();
        tables.queries.remove(fingerprint)
    }

    pub fn contains_query(&self, collection: &str, fingerprint: &Fingerprint) -> bool {
        self.tables(collection).queries.contains(fingerprint)
    }

    /// Current JSON of a cached object.
    pub fn object(&self, collection: &str, id: &DocumentId) -> Option<String> {
        self.tables(collection).objects.get(id)
    }
}

impl Default for MemoryKeyedStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for MemoryKeyedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyedStore")
            .field("collections", &self.tables.len())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn get(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<QueryLookup, KeyedStoreError> {
        let tables = self.tables(collection);
        let _guard = tables.lock.lock();

        let Some(entry) = tables.queries.get(fingerprint) else {
            return Ok(QueryLookup::Miss);
        };

        let mut query = CachedQuery {
            ids: entry.ids.clone(),
            created_at: entry.created_at,
            ..Default::default()
        };
        for id in entry.ids {
            match tables.objects.get(&id) {
                Some(json) => query.hits.push(CachedObject { id, json }),
                None => query.missing.push(id),
            }
        }
        Ok(QueryLookup::Hit(query))
    }

    async fn set(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        common_index: Option<&str>,
        objects: &[CachedObject],
        mode: WriteMode,
    ) -> Result<u64, KeyedStoreError> {
        let tables = self.tables(collection);
        let _guard = tables.lock.lock();

        let mut written = 0;
        for object in objects {
            if tables.objects.contains(&object.id) || tables.tombstones.contains(&object.id) {
                continue;
            }
            tables.objects.insert(object.id.clone(), object.json.clone());
            written += 1;
        }

        let tag = match mode {
            WriteMode::Establish => {
                let entry = QueryEntry {
                    ids: objects.iter().map(|object| object.id.clone()).collect(),
                    created_at: Utc::now(),
                };
                tables.queries.insert(fingerprint.clone(), entry);
                true
            }
            WriteMode::Refill => tables.queries.contains(fingerprint),
        };

        if tag && let Some(common_index) = common_index {
            tables.tag(common_index, fingerprint);
        }

        Ok(written)
    }

    async fn invalidate(&self, invalidation: Invalidation<'_>) -> Result<u64, KeyedStoreError> {
        let tables = self.tables(invalidation.collection);
        let _guard = tables.lock.lock();

        if let Some(key) = invalidation.idempotency_key {
            if tables.markers.contains(&key.to_string()) {
                debug!("Skipping already processed event {}", key);
                return Ok(0);
            }
            tables.markers.insert(key.to_string(), ());
        }

        let id = invalidation.document_id;
        let mut affected = match invalidation.document_json {
            Some(json) => {
                tables.tombstones.remove(id);
                tables.objects.insert(id.clone(), json.to_string());
                1
            }
            None => {
                tables.tombstones.insert(id.clone(), ());
                u64::from(tables.objects.remove(id))
            }
        };

        if let Some(common_index) = invalidation.common_index {
            affected += tables.drop_group(common_index);
        }

        Ok(affected)
    }

    async fn invalidate_group(
        &self,
        collection: &str,
        common_index: &str,
    ) -> Result<u64, KeyedStoreError> {
        let tables = self.tables(collection);
        let _guard = tables.lock.lock();
        Ok(tables.drop_group(common_index))
    }

    async fn get_count(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<u64>, KeyedStoreError> {
        let tables = self.tables(collection);
        match tables.counts.get(fingerprint) {
            Some((count, expires_at)) if Instant::now() < expires_at => Ok(Some(count)),
            Some(_) => {
                tables.counts.remove(fingerprint);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_count(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        count: u64,
        ttl: Duration,
    ) -> Result<(), KeyedStoreError> {
        let tables = self.tables(collection);
        tables
            .counts
            .insert(fingerprint.clone(), (count, Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{FIND, Fingerprint};
    use mongodb::bson::doc;

    fn fp(status: &str) -> Fingerprint {
        Fingerprint::compute::<()>(FIND, "emotes", &doc! { "status": status }, None).unwrap()
    }

    fn object(id: &str, name: &str) -> CachedObject {
        CachedObject {
            id: DocumentId::string(id),
            json: format!(r#"{{"_id":"{}","name":"{}"}}"#, id, name),
        }
    }

    fn hit(lookup: QueryLookup) -> CachedQuery {
        match lookup {
            QueryLookup::Hit(query) => query,
            QueryLookup::Miss => panic!("expected a hit"),
        }
    }

    #[tokio::test]
    async fn test_establish_then_get() {
        let store = MemoryKeyedStore::default();
        let objects = vec![object("a", "pog"), object("b", "kek")];
        let written = store
            .set("emotes", &fp("live"), None, &objects, WriteMode::Establish)
            .await
            .unwrap();
        assert_eq!(written, 2);

        let query = hit(store.get("emotes", &fp("live")).await.unwrap());
        assert_eq!(query.ids, vec![DocumentId::string("a"), DocumentId::string("b")]);
        assert_eq!(query.hits, objects);
        assert!(query.missing.is_empty());
        assert_eq!(store.get("emotes", &fp("pending")).await.unwrap(), QueryLookup::Miss);
    }

    #[tokio::test]
    async fn test_evicted_object_reported_missing() {
        let store = MemoryKeyedStore::default();
        let objects = vec![object("a", "pog"), object("b", "kek")];
        store.set("emotes", &fp("live"), None, &objects, WriteMode::Establish).await.unwrap();
        assert!(store.evict_object("emotes", &DocumentId::string("a")));

        let query = hit(store.get("emotes", &fp("live")).await.unwrap());
        assert_eq!(query.hits, vec![object("b", "kek")]);
        assert_eq!(query.missing, vec![DocumentId::string("a")]);
    }

    #[tokio::test]
    async fn test_refill_keeps_id_list() {
        let store = MemoryKeyedStore::default();
        let objects = vec![object("a", "pog"), object("b", "kek")];
        store.set("emotes", &fp("live"), None, &objects, WriteMode::Establish).await.unwrap();
        store.evict_object("emotes", &DocumentId::string("a"));

        store
            .set("emotes", &fp("live"), None, &[object("a", "pog")], WriteMode::Refill)
            .await
            .unwrap();
        let query = hit(store.get("emotes", &fp("live")).await.unwrap());
        assert_eq!(query.ids.len(), 2);
        assert!(query.missing.is_empty());
    }

    #[tokio::test]
    async fn test_refill_without_entry_does_not_create_one() {
        let store = MemoryKeyedStore::default();
        store
            .set("emotes", &fp("live"), Some("owner:u1"), &[object("a", "pog")], WriteMode::Refill)
            .await
            .unwrap();
        assert!(!store.contains_query("emotes", &fp("live")));
        assert!(store.object("emotes", &DocumentId::string("a")).is_some());
        assert_eq!(store.invalidate_group("emotes", "owner:u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_upsert_and_delete() {
        let store = MemoryKeyedStore::default();
        store
            .set("emotes", &fp("live"), None, &[object("a", "pog")], WriteMode::Establish)
            .await
            .unwrap();
        let id = DocumentId::string("a");
        let updated = r#"{"_id":"a","name":"poggers"}"#;

        let affected = store
            .invalidate(Invalidation {
                idempotency_key: Some("k1"),
                collection: "emotes",
                document_id: &id,
                common_index: None,
                document_json: Some(updated),
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(store.object("emotes", &id).as_deref(), Some(updated));

        store
            .invalidate(Invalidation {
                idempotency_key: Some("k2"),
                collection: "emotes",
                document_id: &id,
                common_index: None,
                document_json: None,
            })
            .await
            .unwrap();
        assert!(store.object("emotes", &id).is_none());
        let query = hit(store.get("emotes", &fp("live")).await.unwrap());
        assert_eq!(query.missing, vec![id]);
    }

    #[tokio::test]
    async fn test_replayed_key_is_noop() {
        let store = MemoryKeyedStore::default();
        let id = DocumentId::string("a");
        let event = Invalidation {
            idempotency_key: Some("same"),
            collection: "emotes",
            document_id: &id,
            common_index: None,
            document_json: Some(r#"{"_id":"a","v":1}"#),
        };
        assert_eq!(store.invalidate(event).await.unwrap(), 1);

        // A different write lands in between, then the first event is redelivered.
        store.tables("emotes").objects.insert(id.clone(), r#"{"_id":"a","v":2}"#.into());
        assert_eq!(store.invalidate(event).await.unwrap(), 0);
        assert_eq!(store.object("emotes", &id).as_deref(), Some(r#"{"_id":"a","v":2}"#));
    }

    fn invalidation<'a>(id: &'a DocumentId, key: &'a str, json: Option<&'a str>) -> Invalidation<'a> {
        Invalidation {
            idempotency_key: Some(key),
            collection: "emotes",
            document_id: id,
            common_index: None,
            document_json: json,
        }
    }

    #[tokio::test]
    async fn test_write_back_does_not_overwrite_newer_object() {
        let store = MemoryKeyedStore::default();
        let id = DocumentId::string("a");
        let newer = r#"{"_id":"a","name":"poggers"}"#;
        store.invalidate(invalidation(&id, "k1", Some(newer))).await.unwrap();

        // A read that fetched the document before the change writes back late.
        let written = store
            .set("emotes", &fp("live"), None, &[object("a", "pog"), object("b", "kek")], WriteMode::Establish)
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.object("emotes", &id).as_deref(), Some(newer));

        let query = hit(store.get("emotes", &fp("live")).await.unwrap());
        assert_eq!(query.ids.len(), 2);
        assert!(query.missing.is_empty());
    }

    #[tokio::test]
    async fn test_write_back_does_not_resurrect_deleted_object() {
        let store = MemoryKeyedStore::default();
        let id = DocumentId::string("a");
        store.invalidate(invalidation(&id, "k1", None)).await.unwrap();

        let written = store
            .set("emotes", &fp("live"), None, &[object("a", "pog")], WriteMode::Establish)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(store.object("emotes", &id).is_none());
        let query = hit(store.get("emotes", &fp("live")).await.unwrap());
        assert_eq!(query.missing, vec![id.clone()]);

        // Re-created under the same id: the new version is cached again.
        let recreated = r#"{"_id":"a","name":"back"}"#;
        store.invalidate(invalidation(&id, "k2", Some(recreated))).await.unwrap();
        assert_eq!(store.object("emotes", &id).as_deref(), Some(recreated));
    }

    #[tokio::test]
    async fn test_group_forgets_expired_queries() {
        let store = MemoryKeyedStore::default();
        let objects = [object("a", "pog")];
        store.set("emotes", &fp("live"), Some("owner:u1"), &objects, WriteMode::Establish).await.unwrap();
        store.evict_query("emotes", &fp("live"));
        store.set("emotes", &fp("pending"), Some("owner:u1"), &objects, WriteMode::Establish).await.unwrap();

        let members = store.tables("emotes").groups.get(&"owner:u1".to_string()).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains(&fp("pending")));
    }

    #[tokio::test]
    async fn test_group_expires_with_its_queries() {
        let store = MemoryKeyedStore::new(StoreConfig::default().query_ttl(Duration::from_millis(50)));
        store
            .set("emotes", &fp("live"), Some("owner:u1"), &[object("a", "pog")], WriteMode::Establish)
            .await
            .unwrap();
        assert!(store.tables("emotes").groups.contains(&"owner:u1".to_string()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!store.tables("emotes").groups.contains(&"owner:u1".to_string()));
        assert_eq!(store.invalidate_group("emotes", "owner:u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_invalidation_is_selective() {
        let store = MemoryKeyedStore::default();
        let objects = [object("a", "pog")];
        store.set("emotes", &fp("live"), Some("owner:u1"), &objects, WriteMode::Establish).await.unwrap();
        store.set("emotes", &fp("pending"), Some("owner:u1"), &objects, WriteMode::Establish).await.unwrap();
        store.set("emotes", &fp("deleted"), Some("owner:u2"), &objects, WriteMode::Establish).await.unwrap();

        assert_eq!(store.invalidate_group("emotes", "owner:u1").await.unwrap(), 2);
        assert!(!store.contains_query("emotes", &fp("live")));
        assert!(!store.contains_query("emotes", &fp("pending")));
        assert!(store.contains_query("emotes", &fp("deleted")));
        // Objects are untouched by group invalidation.
        assert!(store.object("emotes", &DocumentId::string("a")).is_some());
    }

    #[tokio::test]
    async fn test_invalidate_with_common_index_drops_group() {
        let store = MemoryKeyedStore::default();
        store
            .set("emotes", &fp("live"), Some("owner:u1"), &[object("a", "pog")], WriteMode::Establish)
            .await
            .unwrap();
        let id = DocumentId::string("b");
        let affected = store
            .invalidate(Invalidation {
                idempotency_key: None,
                collection: "emotes",
                document_id: &id,
                common_index: Some("owner:u1"),
                document_json: Some(r#"{"_id":"b"}"#),
            })
            .await
            .unwrap();
        assert_eq!(affected, 2);
        assert!(!store.contains_query("emotes", &fp("live")));
    }

    #[tokio::test]
    async fn test_count_expires() {
        let store = MemoryKeyedStore::default();
        store
            .set_count("emotes", &fp("live"), 7, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get_count("emotes", &fp("live")).await.unwrap(), Some(7));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get_count("emotes", &fp("live")).await.unwrap(), None);
    }
}

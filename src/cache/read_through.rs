//! Find, FindOne and GetCollectionSize over the keyed store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{self, Document};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use super::{CacheStats, StatsSnapshot};
use crate::database::{DocumentId, ObjectStore, QueryOptions};
use crate::error::{CacheError, KeyedStoreError};
use crate::fingerprint::{self, Fingerprint};
use crate::keyed::{
    CachedObject, CachedQuery, Invalidation, KeyedStore, QueryLookup, WriteMode, decode_document,
    encode_document,
};

/// Configuration for the read-through cache.
#[derive(Debug, Clone)]
pub struct ReadThroughConfig {
    /// Deadline for every keyed store call. On expiry the call counts as a miss.
    pub store_timeout: Duration,

    /// How long a collection size stays cached.
    pub collection_size_ttl: Duration,
}

impl Default for ReadThroughConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(250),
            collection_size_ttl: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl ReadThroughConfig {
    #[must_use]
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn collection_size_ttl(mut self, ttl: Duration) -> Self {
        self.collection_size_ttl = ttl;
        self
    }
}

/// Read-through, normalized cache over an object store.
///
/// Cloning is cheap and clones share stores and statistics.
#[derive(Clone)]
pub struct ReadThroughCache {
    objects: Arc<dyn ObjectStore>,
    keyed: Arc<dyn KeyedStore>,
    config: ReadThroughConfig,
    stats: Arc<CacheStats>,
}

impl ReadThroughCache {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        keyed: Arc<dyn KeyedStore>,
        config: ReadThroughConfig,
    ) -> Self {
        Self {
            objects,
            keyed,
            config,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// The same cache with a different deadline for keyed store calls.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            config: self.config.clone().store_timeout(timeout),
            ..self.clone()
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// All documents matching `filter`, decoded into `T`.
    ///
    /// `common_index` tags the cached query for group invalidation.
    pub async fn find<T: DeserializeOwned>(
        &self,
        collection: &str,
        common_index: Option<&str>,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Vec<T>, CacheError> {
        let documents = self
            .find_documents(collection, common_index, filter, options)
            .await?;
        documents
            .into_iter()
            .map(|document| bson::from_document(document).map_err(CacheError::from))
            .collect()
    }

    /// All documents matching `filter`, as raw documents.
    pub async fn find_documents(
        &self,
        collection: &str,
        common_index: Option<&str>,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Vec<Document>, CacheError> {
        let common_index = common_index.filter(|index| !index.is_empty());
        let fingerprint = Fingerprint::compute(fingerprint::FIND, collection, &filter, Some(options))?;

        if let Some(cached) = self.lookup(collection, &fingerprint).await? {
            return self.merge(collection, common_index, &fingerprint, cached).await;
        }

        let documents = self.objects.find(collection, filter, options).await?;
        self.establish(collection, common_index, &fingerprint, &documents).await;
        Ok(documents)
    }

    /// First document matching `filter`, decoded into `T`.
    ///
    /// `Ok(None)` means not found, which is not an error.
    pub async fn find_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        common_index: Option<&str>,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Option<T>, CacheError> {
        match self
            .find_one_document(collection, common_index, filter, options)
            .await?
        {
            Some(document) => Ok(Some(bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    /// First document matching `filter`, as a raw document.
    pub async fn find_one_document(
        &self,
        collection: &str,
        common_index: Option<&str>,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Option<Document>, CacheError> {
        let common_index = common_index.filter(|index| !index.is_empty());
        let fingerprint =
            Fingerprint::compute(fingerprint::FIND_ONE, collection, &filter, Some(options))?;

        if let Some(cached) = self.lookup(collection, &fingerprint).await? {
            let documents = self.merge(collection, common_index, &fingerprint, cached).await?;
            return Ok(documents.into_iter().next());
        }

        let document = self.objects.find_one(collection, filter, options).await?;
        self.establish(collection, common_index, &fingerprint, document.as_slice())
            .await;
        Ok(document)
    }

    /// Number of documents matching `filter`.
    ///
    /// Counts are cached for a short, fixed time and are never invalidated
    /// by writes, so they may lag behind by up to that long.
    pub async fn get_collection_size(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<u64, CacheError> {
        let fingerprint =
            Fingerprint::compute(fingerprint::COLLECTION_SIZE, collection, &filter, Some(options))?;

        let cached = self.call(self.keyed.get_count(collection, &fingerprint)).await;
        if let Some(Some(count)) = self.fail_open("get_count", cached)? {
            debug!("Collection size hit on {} ({})", collection, count);
            return Ok(count);
        }

        let count = self.objects.count(collection, filter, options).await?;
        let ttl = self.config.collection_size_ttl;
        if let Err(err) = self
            .call(self.keyed.set_count(collection, &fingerprint, count, ttl))
            .await
        {
            warn!("Failed to cache collection size of {}: {}", collection, err);
        }
        Ok(count)
    }

    /// Drop every cached query tagged with `common_index`.
    ///
    /// Meant to be called by mutations that change which documents a group
    /// of queries returns.
    pub async fn invalidate_group(
        &self,
        collection: &str,
        common_index: &str,
    ) -> Result<u64, KeyedStoreError> {
        self.call(self.keyed.invalidate_group(collection, common_index))
            .await
    }

    /// Apply a write to the object cache right away, without waiting for
    /// the change feed. `None` removes the object.
    pub async fn invalidate_document(
        &self,
        collection: &str,
        document_id: &DocumentId,
        document: Option<&Document>,
        common_index: Option<&str>,
    ) -> Result<u64, KeyedStoreError> {
        let json = document.map(encode_document);
        let invalidation = Invalidation {
            idempotency_key: None,
            collection,
            document_id,
            common_index: common_index.filter(|index| !index.is_empty()),
            document_json: json.as_deref(),
        };
        self.call(self.keyed.invalidate(invalidation)).await
    }

    /// Look up a query entry. `Ok(None)` means go to the object store.
    async fn lookup(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CachedQuery>, CacheError> {
        let lookup = self.call(self.keyed.get(collection, fingerprint)).await;
        match self.fail_open("get", lookup)? {
            Some(QueryLookup::Hit(cached)) => Ok(Some(cached)),
            Some(QueryLookup::Miss) => {
                debug!("Cache miss on {} {}", collection, fingerprint);
                self.stats.record_miss();
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Complete a cached id list with documents, refetching missing ones.
    ///
    /// The id list is authoritative for membership and order. Ids whose
    /// documents are gone from the object store are dropped.
    async fn merge(
        &self,
        collection: &str,
        common_index: Option<&str>,
        fingerprint: &Fingerprint,
        cached: CachedQuery,
    ) -> Result<Vec<Document>, CacheError> {
        let mut documents: HashMap<DocumentId, Document> = HashMap::with_capacity(cached.ids.len());
        for object in cached.hits {
            let document = decode_document(&object.json).map_err(|err| {
                error!("Corrupt object {} in {}: {}", object.id, collection, err);
                CacheError::Protocol(err.to_string())
            })?;
            documents.insert(object.id, document);
        }

        if cached.missing.is_empty() {
            debug!(
                "Cache hit on {} {} ({} ids, cached at {})",
                collection,
                fingerprint,
                cached.ids.len(),
                cached.created_at
            );
            self.stats.record_hit();
        } else {
            let refetched = self.objects.find_by_ids(collection, &cached.missing).await?;
            debug!(
                "Partial hit on {} {}: {} missing, {} refetched",
                collection,
                fingerprint,
                cached.missing.len(),
                refetched.len()
            );
            self.stats.record_partial_hit(refetched.len());

            let mut refill = Vec::with_capacity(refetched.len());
            for document in refetched {
                if let Some(id) = DocumentId::of(&document) {
                    refill.push(CachedObject {
                        id: id.clone(),
                        json: encode_document(&document),
                    });
                    documents.insert(id, document);
                }
            }
            if !refill.is_empty() {
                self.write_back(collection, fingerprint, common_index, &refill, WriteMode::Refill)
                    .await;
            }
        }

        Ok(cached
            .ids
            .into_iter()
            .filter_map(|id| documents.remove(&id))
            .collect())
    }

    /// Cache a freshly evaluated result set.
    async fn establish(
        &self,
        collection: &str,
        common_index: Option<&str>,
        fingerprint: &Fingerprint,
        documents: &[Document],
    ) {
        let mut objects = Vec::with_capacity(documents.len());
        for document in documents {
            let Some(id) = DocumentId::of(document) else {
                debug!("Result of {} on {} has a document without _id, not caching", fingerprint, collection);
                return;
            };
            objects.push(CachedObject {
                id,
                json: encode_document(document),
            });
        }
        self.write_back(collection, fingerprint, common_index, &objects, WriteMode::Establish)
            .await;
    }

    async fn write_back(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        common_index: Option<&str>,
        objects: &[CachedObject],
        mode: WriteMode,
    ) {
        let result = self
            .call(self.keyed.set(collection, fingerprint, common_index, objects, mode))
            .await;
        match result {
            Ok(written) => debug!("Cached {} objects for {} {} ({:?})", written, collection, fingerprint, mode),
            Err(err) if err.is_transient() => warn!("Failed to cache {} {}: {}", collection, fingerprint, err),
            Err(err) => error!("Keyed store rejected write for {} {}: {}", collection, fingerprint, err),
        }
    }

    /// Run a keyed store call under the configured deadline.
    async fn call<T>(
        &self,
        call: impl Future<Output = Result<T, KeyedStoreError>>,
    ) -> Result<T, KeyedStoreError> {
        let timeout = self.config.store_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| KeyedStoreError::Timeout(timeout))?
    }

    /// Turn transient keyed store errors into `None`, protocol errors into errors.
    fn fail_open<T>(
        &self,
        operation: &str,
        result: Result<T, KeyedStoreError>,
    ) -> Result<Option<T>, CacheError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_transient() => {
                warn!("Keyed store {} failed, falling back to object store: {}", operation, err);
                self.stats.record_fallback();
                Ok(None)
            }
            Err(err) => {
                error!("Keyed store {} returned a malformed reply: {}", operation, err);
                Err(CacheError::Protocol(err.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

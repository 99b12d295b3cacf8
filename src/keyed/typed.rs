//! Typed table wrapper around Moka.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

/// A named, typed table with optional time-to-live.
///
/// This table is:
/// - Thread-safe (uses Arc internally)
/// - Bounded, entries may be evicted at any time
/// - Clone-friendly (cloning is cheap, shares the same underlying cache)
pub struct TypedCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Cache<K, V>>,
    name: Arc<str>,
}

// Manual Clone implementation that doesn't require K: Clone, V: Clone
impl<K, V> Clone for TypedCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            name: Arc::clone(&self.name),
        }
    }
}

impl<K, V> TypedCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Arc<str>>, max_capacity: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_capacity);

        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            inner: Arc::new(builder.build()),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    /// Returns `Some(value)` if the key exists and hasn't expired.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Remove a key, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.inner.remove(key).is_some()
    }
}

impl<K, V> std::fmt::Debug for TypedCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCache")
            .field("name", &self.name)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache: TypedCache<String, u64> = TypedCache::new("counts", 10, None);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert!(cache.remove(&"a".to_string()));
        assert!(!cache.remove(&"a".to_string()));
        assert!(!cache.contains(&"a".to_string()));
        assert_eq!(cache.name(), "counts");
    }

    #[test]
    fn test_ttl_expires_entries() {
        let cache: TypedCache<u8, u8> = TypedCache::new("short", 10, Some(Duration::from_millis(20)));
        cache.insert(1, 1);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&1), None);
    }
}

//! Hit/miss accounting for the read-through cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a [`ReadThroughCache`](super::ReadThroughCache).
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    partial_hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
    refetched: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_partial_hit(&self, refetched: usize) {
        self.partial_hits.fetch_add(1, Ordering::Relaxed);
        self.refetched.fetch_add(refetched as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            partial_hits: self.partial_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            refetched: self.refetched.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Queries answered entirely from the keyed store.
    pub hits: u64,
    /// Queries whose id list was cached but some objects had to be refetched.
    pub partial_hits: u64,
    /// Queries with no cache entry.
    pub misses: u64,
    /// Keyed store calls that failed or timed out and fell through.
    pub fallbacks: u64,
    /// Documents refetched by id after partial hits.
    pub refetched: u64,
}

impl StatsSnapshot {
    /// Share of lookups served from a cached id list (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let cached = self.hits + self.partial_hits;
        let total = cached + self.misses;
        if total == 0 {
            0.0
        } else {
            cached as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::default();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);

        stats.record_hit();
        stats.record_partial_hit(2);
        stats.record_miss();
        stats.record_miss();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.refetched, 2);
        assert!((snapshot.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}

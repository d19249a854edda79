//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, evictions and
//! reclaimed stale-generation entries.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time snapshot of cache metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals
    pub misses: u64,
    /// Number of live entries evicted by the LRU policy
    pub evictions: u64,
    /// Number of entries removed because their generation was superseded
    pub reclaimed: u64,
    /// Resident payload bytes
    pub current_size_bytes: u64,
    /// Configured ceiling
    pub max_size_bytes: u64,
    /// Size an eviction pass drives down to
    pub target_size_bytes: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Lock-free counters shared by concurrent callers.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reclaimed: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Copies the counters into a snapshot; size fields are left at zero.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }
}

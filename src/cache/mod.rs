//! Cache Module
//!
//! Disk-backed content cache with LRU eviction and generational
//! invalidation per `(table, tenant)`.

mod accountant;
mod engine;
mod entry;
mod eviction;
mod generation;
mod stats;
mod store;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use accountant::SizeAccountant;
pub use engine::CacheEngine;
pub use entry::{AccessClock, AccessStamp, CacheKey, EntryMeta};
pub use eviction::{EvictionEngine, EvictionReport};
pub use generation::{Advance, GenerationIndex, StaleGeneration};
pub use stats::{CacheStats, StatsRecorder};
pub use store::{
    Census, DurableStore, GenerationRow, PutOutcome, Removed, ScannedEntry, StoreError,
    StoreOptions, StoredEntry,
};

// == Public Constants ==
/// Maximum encoded key length in bytes (LMDB's default key limit)
pub const MAX_KEY_LENGTH: usize = 511;

/// Entries examined per LRU eviction round
pub const EVICTION_BATCH_SIZE: usize = 256;

//! Key/Generation Index
//!
//! In-memory view of which freshness tag is active for each
//! `(table, tenant)` pair, the queue of superseded generations waiting to be
//! reclaimed, and the per-pair locks that serialise generation changes.
//!
//! The index only holds the scalar mapping. Entries of a superseded
//! generation are enumerated by the store through the
//! `(table, tenant, freshness)` key prefix.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::cache::store::GenerationRow;

/// Number of pair lock shards. Power of two.
const LOCK_SHARDS: usize = 64;

type PairKey = (String, String);

// == Stale Generation ==
/// A generation that is no longer visible and whose entries can be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaleGeneration {
    pub table: String,
    pub tenant_id: String,
    pub freshness: String,
}

// == Advance ==
/// Result of moving a pair to a freshness tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The tag was already active
    Unchanged,
    /// First generation recorded for the pair
    Created,
    /// The pair moved on; the previous generation is now stale
    Bumped(StaleGeneration),
}

impl Advance {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Advance::Unchanged)
    }
}

// == Generation Index ==
#[derive(Debug)]
pub struct GenerationIndex {
    active: RwLock<HashMap<PairKey, String>>,
    stale: Mutex<VecDeque<StaleGeneration>>,
    locks: Box<[Mutex<()>]>,
}

impl Default for GenerationIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationIndex {
    // == Constructor ==
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            stale: Mutex::new(VecDeque::new()),
            locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Builds the index from persisted generation records.
    pub fn from_rows(rows: impl IntoIterator<Item = GenerationRow>) -> Self {
        let index = Self::new();
        {
            let mut active = index.active.write();
            for row in rows {
                active.insert((row.table, row.tenant_id), row.freshness);
            }
        }
        index
    }

    // == Active Freshness ==
    /// Currently visible freshness tag of a pair.
    pub fn active_freshness(&self, table: &str, tenant_id: &str) -> Option<String> {
        self.active
            .read()
            .get(&(table.to_string(), tenant_id.to_string()))
            .cloned()
    }

    /// True if `freshness` is the visible generation of the pair.
    pub fn is_active(&self, table: &str, tenant_id: &str, freshness: &str) -> bool {
        self.active
            .read()
            .get(&(table.to_string(), tenant_id.to_string()))
            .is_some_and(|active| active == freshness)
    }

    /// Classifies what `advance` would do, without changing anything.
    pub fn plan(&self, table: &str, tenant_id: &str, freshness: &str) -> Advance {
        match self.active_freshness(table, tenant_id) {
            Some(active) if active == freshness => Advance::Unchanged,
            Some(active) => Advance::Bumped(StaleGeneration {
                table: table.to_string(),
                tenant_id: tenant_id.to_string(),
                freshness: active,
            }),
            None => Advance::Created,
        }
    }

    // == Advance ==
    /// Makes `freshness` the active generation of the pair.
    ///
    /// A superseded generation is queued for reclaim and returned. Callers
    /// hold the pair lock and have already persisted the new record.
    pub fn advance(&self, table: &str, tenant_id: &str, freshness: &str) -> Advance {
        let previous = self.active.write().insert(
            (table.to_string(), tenant_id.to_string()),
            freshness.to_string(),
        );

        match previous {
            Some(old) if old == freshness => Advance::Unchanged,
            Some(old) => {
                let stale = StaleGeneration {
                    table: table.to_string(),
                    tenant_id: tenant_id.to_string(),
                    freshness: old,
                };
                self.queue_stale(stale.clone());
                Advance::Bumped(stale)
            }
            None => Advance::Created,
        }
    }

    /// Drops every generation record of `table`.
    pub fn forget_table(&self, table: &str) -> usize {
        let mut active = self.active.write();
        let before = active.len();
        active.retain(|(t, _), _| t != table);
        before - active.len()
    }

    // == Stale Queue ==
    /// Queues a generation for reclaim, ignoring duplicates.
    pub fn queue_stale(&self, stale: StaleGeneration) {
        let mut queue = self.stale.lock();
        if !queue.contains(&stale) {
            queue.push_back(stale);
        }
    }

    /// Takes every queued stale generation.
    pub fn drain_stale(&self) -> Vec<StaleGeneration> {
        self.stale.lock().drain(..).collect()
    }

    /// Number of generations waiting for reclaim.
    pub fn pending_stale(&self) -> usize {
        self.stale.lock().len()
    }

    /// Number of pairs with an active generation.
    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }

    // == Pair Locks ==
    /// Locks the shard guarding `(table, tenant)`.
    pub fn lock_pair(&self, table: &str, tenant_id: &str) -> MutexGuard<'_, ()> {
        self.locks[shard_index(table, tenant_id)].lock()
    }

    /// Locks every shard, in index order.
    pub fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.locks.iter().map(|lock| lock.lock()).collect()
    }
}

fn shard_index(table: &str, tenant_id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    table.hash(&mut hasher);
    tenant_id.hash(&mut hasher);
    (hasher.finish() as usize) & (LOCK_SHARDS - 1)
}

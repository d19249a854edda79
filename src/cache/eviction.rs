//! Eviction Engine Module
//!
//! Brings the resident size back under control. Superseded generations are
//! always reclaimed first; live entries are then evicted least recently
//! accessed first until the total is at or below the eviction target.

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::accountant::SizeAccountant;
use crate::cache::generation::GenerationIndex;
use crate::cache::stats::StatsRecorder;
use crate::cache::store::{DurableStore, Removed, ScannedEntry, StoreError};

/// Consecutive scans in which every candidate was touched concurrently
/// before a pass gives up.
const MAX_STALLED_ROUNDS: usize = 8;

// == Eviction Report ==
/// What one pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries of superseded generations
    pub reclaimed: Removed,
    /// Live entries removed by the LRU policy
    pub evicted: Removed,
}

// == Eviction Engine ==
#[derive(Debug)]
pub struct EvictionEngine {
    /// Serialises passes; only one runs at a time
    pass: Mutex<()>,
    batch_size: usize,
}

impl EvictionEngine {
    /// Creates an engine scanning `batch_size` entries per LRU round.
    pub fn new(batch_size: usize) -> Self {
        Self {
            pass: Mutex::new(()),
            batch_size: batch_size.max(1),
        }
    }

    // == Reclaim Stale ==
    /// Removes every entry of the generations queued as stale.
    pub fn reclaim_stale(
        &self,
        store: &DurableStore,
        index: &GenerationIndex,
        accountant: &SizeAccountant,
        stats: &StatsRecorder,
    ) -> Result<Removed, StoreError> {
        let _pass = self.pass.lock();
        self.reclaim_locked(store, index, accountant, stats)
    }

    // == Evict To Target ==
    /// Reclaims stale generations, then evicts the least recently accessed
    /// live entries until the resident size is at or below the target.
    pub fn evict_to_target(
        &self,
        store: &DurableStore,
        index: &GenerationIndex,
        accountant: &SizeAccountant,
        stats: &StatsRecorder,
    ) -> Result<EvictionReport, StoreError> {
        let _pass = self.pass.lock();
        let mut report = EvictionReport {
            reclaimed: self.reclaim_locked(store, index, accountant, stats)?,
            ..EvictionReport::default()
        };

        let mut stalled = 0;
        while let Some(excess) = accountant.excess_over_target() {
            // a concurrent Set may have superseded a generation meanwhile
            if index.pending_stale() > 0 {
                report.reclaimed += self.reclaim_locked(store, index, accountant, stats)?;
                continue;
            }

            let scanned = store.scan_by_access_order(self.batch_size)?;
            if scanned.is_empty() {
                break;
            }

            let victims = select_victims(scanned, excess);
            let removed = store.delete_entries(&victims)?;
            accountant.release(removed.bytes);
            stats.record_evictions(removed.count);
            report.evicted += removed;

            if removed.count == 0 {
                stalled += 1;
                if stalled >= MAX_STALLED_ROUNDS {
                    warn!(
                        "Eviction gave up after {} rounds without progress ({} bytes over target)",
                        stalled, excess
                    );
                    break;
                }
            } else {
                stalled = 0;
            }
        }

        if report.evicted.count > 0 || report.reclaimed.count > 0 {
            info!(
                "Eviction pass: reclaimed {} stale entries ({} bytes), evicted {} entries ({} bytes), now {} bytes",
                report.reclaimed.count,
                report.reclaimed.bytes,
                report.evicted.count,
                report.evicted.bytes,
                accountant.current()
            );
        }
        Ok(report)
    }

    fn reclaim_locked(
        &self,
        store: &DurableStore,
        index: &GenerationIndex,
        accountant: &SizeAccountant,
        stats: &StatsRecorder,
    ) -> Result<Removed, StoreError> {
        let mut total = Removed::default();
        let mut pending = index.drain_stale().into_iter();

        while let Some(stale) = pending.next() {
            let result = {
                let _pair = index.lock_pair(&stale.table, &stale.tenant_id);
                if index.is_active(&stale.table, &stale.tenant_id, &stale.freshness) {
                    // reactivated; the activating write purged its leftovers
                    continue;
                }
                store
                    .delete_generation(&stale.table, &stale.tenant_id, &stale.freshness)
                    .inspect(|removed| {
                        accountant.release(removed.bytes);
                    })
            };

            match result {
                Ok(removed) => {
                    if removed.count > 0 {
                        debug!(
                            "Reclaimed {} entries of {}/{} generation {}",
                            removed.count, stale.table, stale.tenant_id, stale.freshness
                        );
                    }
                    stats.record_reclaimed(removed.count);
                    total += removed;
                }
                Err(err) => {
                    index.queue_stale(stale);
                    for rest in pending {
                        index.queue_stale(rest);
                    }
                    return Err(err);
                }
            }
        }

        Ok(total)
    }
}

/// Oldest-first prefix of `scanned` whose sizes cover `excess`.
fn select_victims(scanned: Vec<ScannedEntry>, excess: u64) -> Vec<ScannedEntry> {
    let mut freed = 0u64;
    scanned
        .into_iter()
        .take_while(|entry| {
            let take = freed < excess;
            if take {
                freed = freed.saturating_add(entry.size_bytes);
            }
            take
        })
        .collect()
}

//! Cache Engine Module
//!
//! Orchestrates the store, the generation index, the size accountant and the
//! eviction engine behind the five operations `init`, `get`, `set`,
//! `delete` and `close`, and enforces the engine lifecycle
//! `Uninitialized -> Ready -> Closed`.

use std::fs;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::accountant::SizeAccountant;
use crate::cache::entry::{AccessClock, CacheKey};
use crate::cache::eviction::EvictionEngine;
use crate::cache::generation::{Advance, GenerationIndex, StaleGeneration};
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::cache::store::{DurableStore, Removed, StoreOptions};
use crate::cache::EVICTION_BATCH_SIZE;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == Engine State ==
enum EngineState {
    Uninitialized,
    Ready(Box<EngineCore>),
    Closed,
}

/// Everything a ready engine owns.
struct EngineCore {
    store: DurableStore,
    index: GenerationIndex,
    accountant: SizeAccountant,
    eviction: EvictionEngine,
    stats: StatsRecorder,
    clock: AccessClock,
}

// == Cache Engine ==
/// Thread-safe cache engine.
///
/// Every operation holds the lifecycle lock in read mode for its whole
/// duration, so `close` waits for in-flight operations to finish.
pub struct CacheEngine {
    state: RwLock<EngineState>,
}

impl Default for CacheEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.read() {
            EngineState::Uninitialized => "Uninitialized",
            EngineState::Ready(_) => "Ready",
            EngineState::Closed => "Closed",
        };
        f.debug_struct("CacheEngine").field("state", &state).finish()
    }
}

impl CacheEngine {
    // == Constructor ==
    /// Creates an engine in the `Uninitialized` state.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::Uninitialized),
        }
    }

    /// Creates and initialises an engine in one step.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let engine = Self::new();
        engine.init(config)?;
        Ok(engine)
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.read(), EngineState::Ready(_))
    }

    // == Init ==
    /// Opens the store under `config.base_dir` and makes the engine `Ready`.
    ///
    /// Existing store contents are picked up: the active generations and
    /// the resident size are rebuilt, leftover entries of superseded
    /// generations are reclaimed, and the cache is evicted down to its
    /// target if it is over the limit.
    ///
    /// Initialising a `Ready` engine is an invalid argument; a `Closed`
    /// engine cannot be initialised again.
    pub fn init(&self, config: CacheConfig) -> Result<()> {
        config.validate()?;

        let mut state = self.state.write();
        match &*state {
            EngineState::Ready(_) => {
                return Err(CacheError::InvalidArgument(
                    "cache is already initialized".to_string(),
                ))
            }
            EngineState::Closed => {
                return Err(CacheError::NotInitialized(
                    "cache has been closed".to_string(),
                ))
            }
            EngineState::Uninitialized => {}
        }

        let core = EngineCore::open(&config)?;
        *state = EngineState::Ready(Box::new(core));

        info!(
            "Cache initialized at {} (max {} bytes, cap {})",
            config.base_dir.display(),
            config.max_size_bytes,
            config.cap_ratio
        );
        Ok(())
    }

    // == Get ==
    /// Returns the payload stored under the key, if its generation is the
    /// active one for `(table, tenant_id)`.
    pub fn get(&self, table: &str, tenant_id: &str, freshness: &str, bind: &str) -> Result<Vec<u8>> {
        let state = self.state.read();
        let core = ready(&state)?;
        let key = CacheKey::new(table, tenant_id, freshness, bind)?;
        core.get(&key)
    }

    // == Set ==
    /// Stores `content` under the key, making `freshness` the active
    /// generation of `(table, tenant_id)`.
    pub fn set(
        &self,
        table: &str,
        tenant_id: &str,
        freshness: &str,
        bind: &str,
        content: &[u8],
    ) -> Result<()> {
        let state = self.state.read();
        let core = ready(&state)?;
        let key = CacheKey::new(table, tenant_id, freshness, bind)?;
        core.set(&key, content)
    }

    // == Delete ==
    /// Removes every entry of `table`, across all tenants and generations.
    ///
    /// Returns the number of entries removed.
    pub fn delete(&self, table: &str) -> Result<u64> {
        let state = self.state.read();
        let core = ready(&state)?;
        if table.is_empty() {
            return Err(CacheError::InvalidArgument(
                "table cannot be empty".to_string(),
            ));
        }
        core.delete(table)
    }

    // == Close ==
    /// Flushes and closes the store. The engine ends up `Closed` even if
    /// the final flush fails.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if !matches!(&*state, EngineState::Ready(_)) {
            return Err(not_initialized(&state));
        }

        let previous = std::mem::replace(&mut *state, EngineState::Closed);
        if let EngineState::Ready(core) = previous {
            let stats = core.stats();
            core.store.close()?;
            info!(
                "Cache closed ({} hits, {} misses, {} evictions, {} bytes resident)",
                stats.hits, stats.misses, stats.evictions, stats.current_size_bytes
            );
        }
        Ok(())
    }

    // == Stats ==
    /// Snapshot of the engine's counters and sizes.
    pub fn stats(&self) -> Result<CacheStats> {
        let state = self.state.read();
        Ok(ready(&state)?.stats())
    }
}

fn ready(state: &EngineState) -> Result<&EngineCore> {
    match state {
        EngineState::Ready(core) => Ok(&**core),
        other => Err(not_initialized(other)),
    }
}

fn not_initialized(state: &EngineState) -> CacheError {
    match state {
        EngineState::Closed => CacheError::NotInitialized("cache has been closed".to_string()),
        _ => CacheError::NotInitialized("cache is not initialized".to_string()),
    }
}

impl EngineCore {
    // == Open ==
    fn open(config: &CacheConfig) -> Result<Self> {
        let dir = &config.base_dir;
        if dir.exists() && !dir.is_dir() {
            return Err(CacheError::InvalidArgument(format!(
                "base_dir {} is not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(dir).map_err(|err| match err.kind() {
            std::io::ErrorKind::StorageFull => CacheError::DiskExhausted(err.to_string()),
            _ => CacheError::InvalidArgument(format!(
                "base_dir {} cannot be created: {}",
                dir.display(),
                err
            )),
        })?;

        let options = StoreOptions {
            map_size: config
                .map_size
                .unwrap_or_else(|| StoreOptions::map_size_for(config.max_size_bytes)),
            sync_writes: config.sync_writes,
        };
        let store = DurableStore::open(dir, &options)?;

        let index = GenerationIndex::from_rows(store.generations()?);
        let census = store.census()?;

        for (table, tenant_id, freshness) in census.resident_generations {
            if !index.is_active(&table, &tenant_id, &freshness) {
                index.queue_stale(StaleGeneration {
                    table,
                    tenant_id,
                    freshness,
                });
            }
        }

        let core = Self {
            accountant: SizeAccountant::new(
                config.max_size_bytes,
                config.cap_ratio,
                census.resident_bytes,
            ),
            clock: AccessClock::resume_after(census.latest, census.max_seq),
            eviction: EvictionEngine::new(EVICTION_BATCH_SIZE),
            stats: StatsRecorder::new(),
            store,
            index,
        };

        if census.entries > 0 {
            info!(
                "Resuming cache: {} entries, {} bytes, {} active generations, {} stale",
                census.entries,
                census.resident_bytes,
                core.index.len(),
                core.index.pending_stale()
            );
        }

        core.reclaim()?;
        if core.accountant.over_limit() {
            core.evict()?;
        }
        Ok(core)
    }

    fn get(&self, key: &CacheKey) -> Result<Vec<u8>> {
        if !self.index.is_active(&key.table, &key.tenant_id, &key.freshness) {
            self.stats.record_miss();
            return Err(CacheError::NotFound);
        }

        let Some(entry) = self.store.get(key)? else {
            self.stats.record_miss();
            return Err(CacheError::NotFound);
        };

        if let Err(err) = self.store.touch(key, self.clock.refresh(entry.meta.stamp)) {
            warn!("Failed to refresh access time of {}/{}: {}", key.table, key.bind, err);
        }

        self.stats.record_hit();
        Ok(entry.payload)
    }

    fn set(&self, key: &CacheKey, content: &[u8]) -> Result<()> {
        let size = content.len() as u64;
        if size > self.accountant.max_size_bytes() {
            return Err(CacheError::InvalidArgument(format!(
                "content of {} bytes exceeds the maximum cache size of {} bytes",
                size,
                self.accountant.max_size_bytes()
            )));
        }

        let advance = {
            let _pair = self.index.lock_pair(&key.table, &key.tenant_id);
            let plan = self.index.plan(&key.table, &key.tenant_id, &key.freshness);
            let outcome =
                self.store
                    .put(key, content, self.clock.insertion(), !plan.is_unchanged())?;
            let advance = self.index.advance(&key.table, &key.tenant_id, &key.freshness);
            self.accountant.account(outcome.delta());
            advance
        };

        if let Advance::Bumped(stale) = &advance {
            debug!(
                "Generation of {}/{} advanced from {} to {}",
                stale.table, stale.tenant_id, stale.freshness, key.freshness
            );
            // the write is committed; unreclaimed generations stay queued
            if let Err(err) = self.reclaim() {
                warn!("Reclaim after write to {}/{} failed: {}", key.table, key.tenant_id, err);
            }
        }
        if self.accountant.over_limit() {
            // retried by the next write that finds the cache over its limit
            if let Err(err) = self.evict() {
                warn!("Eviction after write to {}/{} failed: {}", key.table, key.tenant_id, err);
            }
        }
        Ok(())
    }

    fn delete(&self, table: &str) -> Result<u64> {
        let removed = {
            let _all = self.index.lock_all();
            let removed = self.store.delete_by_prefix(table)?;
            self.index.forget_table(table);
            self.accountant.release(removed.bytes);
            removed
        };
        info!(
            "Deleted table {} ({} entries, {} bytes)",
            table, removed.count, removed.bytes
        );
        Ok(removed.count)
    }

    fn reclaim(&self) -> Result<Removed> {
        Ok(self
            .eviction
            .reclaim_stale(&self.store, &self.index, &self.accountant, &self.stats)?)
    }

    fn evict(&self) -> Result<()> {
        self.eviction
            .evict_to_target(&self.store, &self.index, &self.accountant, &self.stats)?;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            current_size_bytes: self.accountant.current(),
            max_size_bytes: self.accountant.max_size_bytes(),
            target_size_bytes: self.accountant.target_bytes(),
            ..self.stats.snapshot()
        }
    }
}

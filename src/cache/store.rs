//! Durable Store Module
//!
//! Single LMDB environment (via heed) holding every cache entry of one
//! engine. All mutations run in one write transaction each, so a crash or a
//! failed write never leaves a partially written entry behind.
//!
//! # Layout
//!
//! - `payloads`: encoded key -> content bytes
//! - `metas`: encoded key -> [`EntryMeta`] (size and access stamp)
//! - `access`: encoded [`AccessStamp`] -> encoded key, iterated oldest first
//! - `generations`: encoded `(table, tenant)` -> active freshness
//!
//! # Headroom
//!
//! LMDB needs free pages to commit a delete, so a full map would block the
//! very transactions that free it. Puts are refused with
//! [`StoreError::DiskExhausted`] once they would eat into a reserve of at least
//! one eighth of the map, which is left to deletes and reclaim.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::entry::{AccessStamp, CacheKey, EntryMeta};

const MIB: usize = 1024 * 1024;

/// Headroom added on top of twice the configured maximum size.
const MAP_SLACK_BYTES: usize = 16 * MIB;

/// Smallest share of the map kept free for delete transactions.
const DELETE_RESERVE_MIN: u64 = 256 * 1024;

/// Page allowance charged to every put on top of the payload.
const PUT_OVERHEAD_BYTES: u64 = 16 * 1024;

// == Store Error ==
/// Failures surfaced by the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The storage medium (or the environment's map) has no room left
    #[error("storage exhausted: {0}")]
    DiskExhausted(String),

    /// I/O failure other than running out of space
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// LMDB failure
    #[error("LMDB error: {0}")]
    Lmdb(#[source] heed::Error),

    /// A stored record could not be decoded
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            StoreError::DiskExhausted(err.to_string())
        } else {
            StoreError::Io(err)
        }
    }
}

impl From<heed::Error> for StoreError {
    fn from(err: heed::Error) -> Self {
        match err {
            heed::Error::Mdb(MdbError::MapFull) => {
                StoreError::DiskExhausted("cache map is full".to_string())
            }
            heed::Error::Io(io_err) => StoreError::from(io_err),
            other => StoreError::Lmdb(other),
        }
    }
}

type StoreResult<T> = std::result::Result<T, StoreError>;

// == Options ==
/// Parameters for opening a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Size of the LMDB memory map, the hard ceiling of the data file
    pub map_size: usize,
    /// Flush to disk on every commit
    pub sync_writes: bool,
}

impl StoreOptions {
    /// Map size for a cache bounded at `max_size_bytes`.
    ///
    /// Twice the maximum plus fixed headroom, rounded up to whole MiB, so
    /// copy-on-write pages and freed-but-not-yet-reusable pages fit while
    /// the resident payload sits at its limit.
    pub fn map_size_for(max_size_bytes: u64) -> usize {
        let wanted = usize::try_from(max_size_bytes)
            .unwrap_or(usize::MAX)
            .saturating_mul(2)
            .saturating_add(MAP_SLACK_BYTES);
        wanted.div_ceil(MIB).saturating_mul(MIB)
    }
}

// == Results ==
/// Outcome of a successful `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub size_bytes: u64,
    /// Size of the entry that was overwritten, if any
    pub previous_size: Option<u64>,
    /// Leftovers of the activated generation removed before the write
    pub purged: Removed,
}

impl PutOutcome {
    /// Change in resident bytes caused by the write.
    pub fn delta(&self) -> i64 {
        self.size_bytes as i64
            - self.previous_size.unwrap_or(0) as i64
            - self.purged.bytes as i64
    }
}

/// Entries removed by a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub count: u64,
    pub bytes: u64,
}

impl Removed {
    fn add(&mut self, size_bytes: u64) {
        self.count += 1;
        self.bytes += size_bytes;
    }
}

impl AddAssign for Removed {
    fn add_assign(&mut self, other: Removed) {
        self.count += other.count;
        self.bytes += other.bytes;
    }
}

/// An entry read back from the store.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub payload: Vec<u8>,
    pub meta: EntryMeta,
}

/// One row of an access-order scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    pub key: CacheKey,
    pub size_bytes: u64,
    pub stamp: AccessStamp,
}

/// Persisted generation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRow {
    pub table: String,
    pub tenant_id: String,
    pub freshness: String,
}

/// Totals gathered by a full scan at start-up.
#[derive(Debug, Clone, Default)]
pub struct Census {
    pub entries: u64,
    pub resident_bytes: u64,
    /// Every `(table, tenant, freshness)` that still owns at least one entry
    pub resident_generations: HashSet<(String, String, String)>,
    pub latest: Option<AccessStamp>,
    pub max_seq: u64,
}

// == Durable Store ==
/// LMDB-backed entry store.
pub struct DurableStore {
    env: Env,
    payloads: Database<Bytes, Bytes>,
    metas: Database<Bytes, Bytes>,
    access: Database<Bytes, Bytes>,
    generations: Database<Bytes, Bytes>,
    /// Bytes puts may fill before the delete reserve
    write_limit: u64,
    path: PathBuf,
}

impl DurableStore {
    // == Open ==
    /// Opens or creates the store in `dir`.
    pub fn open(dir: &Path, options: &StoreOptions) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;

        let mut env_options = EnvOpenOptions::new();
        env_options.map_size(options.map_size).max_dbs(4);
        if !options.sync_writes {
            // SAFETY: NO_SYNC only trades durability of the latest commits
            // for speed; the cache can always be refilled.
            unsafe {
                env_options.flags(EnvFlags::NO_SYNC);
            }
        }

        // SAFETY: a base directory is private to one engine; nothing else
        // maps or truncates these files while the environment is open.
        let env = unsafe { env_options.open(dir)? };

        let mut wtxn = env.write_txn()?;
        let payloads: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some("payloads"))?;
        let metas: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some("metas"))?;
        let access: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some("access"))?;
        let generations: Database<Bytes, Bytes> =
            env.create_database(&mut wtxn, Some("generations"))?;
        wtxn.commit()?;

        info!(
            "Durable store opened at {} (map size {} bytes)",
            dir.display(),
            options.map_size
        );

        let map_size = options.map_size as u64;
        let reserve = (map_size / 8).max(DELETE_RESERVE_MIN);

        Ok(Self {
            env,
            payloads,
            metas,
            access,
            generations,
            write_limit: map_size.saturating_sub(reserve),
            path: dir.to_path_buf(),
        })
    }

    // == Put ==
    /// Writes `payload` under `key`, replacing any existing entry.
    ///
    /// With `activate` set, the key's freshness is recorded as the active
    /// generation of its `(table, tenant)` pair in the same transaction, and
    /// entries left over from an earlier use of that freshness are removed
    /// first so they can never become visible again.
    pub fn put(
        &self,
        key: &CacheKey,
        payload: &[u8],
        stamp: AccessStamp,
        activate: bool,
    ) -> StoreResult<PutOutcome> {
        let encoded = key.encode();
        let meta = EntryMeta {
            size_bytes: payload.len() as u64,
            stamp,
        };

        let mut wtxn = self.env.write_txn()?;

        let needed = self
            .used_bytes(&wtxn)?
            .saturating_add(meta.size_bytes)
            .saturating_add(PUT_OVERHEAD_BYTES);
        if needed > self.write_limit {
            return Err(StoreError::DiskExhausted(format!(
                "writing {} bytes would leave no room for deletes",
                meta.size_bytes
            )));
        }

        let mut purged = Removed::default();
        if activate {
            let prefix = CacheKey::generation_prefix(&key.table, &key.tenant_id, &key.freshness);
            let leftovers = self.collect_prefix(&wtxn, &prefix)?;
            purged = self.remove_entries(&mut wtxn, &leftovers)?;

            let pair = CacheKey::pair_prefix(&key.table, &key.tenant_id);
            self.generations
                .put(&mut wtxn, &pair, key.freshness.as_bytes())?;
        }

        let previous = self.read_meta(&wtxn, &encoded)?;
        if let Some(prev) = previous {
            self.access.delete(&mut wtxn, &prev.stamp.encode())?;
        }

        self.payloads.put(&mut wtxn, &encoded, payload)?;
        self.metas.put(&mut wtxn, &encoded, &meta.encode())?;
        self.access.put(&mut wtxn, &stamp.encode(), &encoded)?;

        wtxn.commit()?;

        Ok(PutOutcome {
            size_bytes: meta.size_bytes,
            previous_size: previous.map(|m| m.size_bytes),
            purged,
        })
    }

    // == Get ==
    /// Reads the entry stored under `key`.
    pub fn get(&self, key: &CacheKey) -> StoreResult<Option<StoredEntry>> {
        let encoded = key.encode();
        let rtxn = self.env.read_txn()?;

        let Some(meta) = self.read_meta(&rtxn, &encoded)? else {
            return Ok(None);
        };
        let payload = self
            .payloads
            .get(&rtxn, &encoded)?
            .ok_or_else(|| StoreError::Corrupt("entry metadata without payload".to_string()))?;

        Ok(Some(StoredEntry {
            payload: payload.to_vec(),
            meta,
        }))
    }

    // == Touch ==
    /// Moves an entry to `stamp` in access order.
    ///
    /// Skipped (returns false) when the entry is gone, was rewritten since it
    /// was read, or already carries a newer stamp.
    pub fn touch(&self, key: &CacheKey, stamp: AccessStamp) -> StoreResult<bool> {
        let encoded = key.encode();
        let mut wtxn = self.env.write_txn()?;

        let Some(mut meta) = self.read_meta(&wtxn, &encoded)? else {
            return Ok(false);
        };
        if meta.stamp.seq != stamp.seq || meta.stamp >= stamp {
            return Ok(false);
        }

        self.access.delete(&mut wtxn, &meta.stamp.encode())?;
        meta.stamp = stamp;
        self.metas.put(&mut wtxn, &encoded, &meta.encode())?;
        self.access.put(&mut wtxn, &stamp.encode(), &encoded)?;
        wtxn.commit()?;
        Ok(true)
    }

    // == Delete By Prefix ==
    /// Removes every entry of `table` (all tenants and freshness values)
    /// together with the table's generation records.
    pub fn delete_by_prefix(&self, table: &str) -> StoreResult<Removed> {
        let prefix = CacheKey::table_prefix(table);
        let mut wtxn = self.env.write_txn()?;

        let doomed = self.collect_prefix(&wtxn, &prefix)?;
        let removed = self.remove_entries(&mut wtxn, &doomed)?;

        let pairs = {
            let mut pairs = Vec::new();
            for item in self.generations.prefix_iter(&wtxn, &prefix)? {
                let (pair, _) = item?;
                pairs.push(pair.to_vec());
            }
            pairs
        };
        for pair in &pairs {
            self.generations.delete(&mut wtxn, pair)?;
        }

        wtxn.commit()?;
        debug!(
            "Deleted table {}: {} entries, {} bytes, {} generation records",
            table,
            removed.count,
            removed.bytes,
            pairs.len()
        );
        Ok(removed)
    }

    // == Delete Generation ==
    /// Removes every entry stored under one generation of a pair.
    pub fn delete_generation(
        &self,
        table: &str,
        tenant_id: &str,
        freshness: &str,
    ) -> StoreResult<Removed> {
        let prefix = CacheKey::generation_prefix(table, tenant_id, freshness);
        let mut wtxn = self.env.write_txn()?;
        let doomed = self.collect_prefix(&wtxn, &prefix)?;
        let removed = self.remove_entries(&mut wtxn, &doomed)?;
        wtxn.commit()?;
        Ok(removed)
    }

    // == Delete Entries ==
    /// Removes scanned entries whose access stamp is still the scanned one.
    ///
    /// Entries read or rewritten since the scan are left alone.
    pub fn delete_entries(&self, candidates: &[ScannedEntry]) -> StoreResult<Removed> {
        let mut wtxn = self.env.write_txn()?;
        let mut doomed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let encoded = candidate.key.encode();
            if let Some(meta) = self.read_meta(&wtxn, &encoded)? {
                if meta.stamp == candidate.stamp {
                    doomed.push((encoded, meta));
                }
            }
        }
        let removed = self.remove_entries(&mut wtxn, &doomed)?;
        wtxn.commit()?;
        Ok(removed)
    }

    // == Scan By Access Order ==
    /// Returns up to `limit` entries, least recently accessed first.
    pub fn scan_by_access_order(&self, limit: usize) -> StoreResult<Vec<ScannedEntry>> {
        let rtxn = self.env.read_txn()?;
        let mut scanned = Vec::with_capacity(limit.min(1024));

        for item in self.access.iter(&rtxn)?.take(limit) {
            let (stamp_bytes, key_bytes) = item?;
            let stamp = AccessStamp::decode(stamp_bytes)
                .ok_or_else(|| StoreError::Corrupt("malformed access stamp".to_string()))?;
            let key = CacheKey::decode(key_bytes)
                .ok_or_else(|| StoreError::Corrupt("malformed cache key".to_string()))?;
            let meta = self
                .read_meta(&rtxn, key_bytes)?
                .ok_or_else(|| StoreError::Corrupt("access entry without metadata".to_string()))?;
            scanned.push(ScannedEntry {
                key,
                size_bytes: meta.size_bytes,
                stamp,
            });
        }

        Ok(scanned)
    }

    // == Generations ==
    /// Loads every persisted generation record.
    pub fn generations(&self) -> StoreResult<Vec<GenerationRow>> {
        let rtxn = self.env.read_txn()?;
        let mut rows = Vec::new();
        for item in self.generations.iter(&rtxn)? {
            let (pair, freshness) = item?;
            let (table, tenant_id) = CacheKey::decode_pair(pair)
                .ok_or_else(|| StoreError::Corrupt("malformed generation key".to_string()))?;
            let freshness = String::from_utf8(freshness.to_vec())
                .map_err(|_| StoreError::Corrupt("non UTF-8 freshness".to_string()))?;
            rows.push(GenerationRow {
                table,
                tenant_id,
                freshness,
            });
        }
        Ok(rows)
    }

    // == Census ==
    /// Scans all entry metadata, for rebuilding in-memory state at start-up.
    pub fn census(&self) -> StoreResult<Census> {
        let rtxn = self.env.read_txn()?;
        let mut census = Census::default();

        for item in self.metas.iter(&rtxn)? {
            let (key_bytes, meta_bytes) = item?;
            let key = CacheKey::decode(key_bytes)
                .ok_or_else(|| StoreError::Corrupt("malformed cache key".to_string()))?;
            let meta = EntryMeta::decode(meta_bytes)
                .ok_or_else(|| StoreError::Corrupt("malformed entry metadata".to_string()))?;

            census.entries += 1;
            census.resident_bytes += meta.size_bytes;
            census.max_seq = census.max_seq.max(meta.stamp.seq);
            census
                .resident_generations
                .insert((key.table, key.tenant_id, key.freshness));
        }

        census.latest = match self.access.last(&rtxn)? {
            Some((stamp_bytes, _)) => Some(
                AccessStamp::decode(stamp_bytes)
                    .ok_or_else(|| StoreError::Corrupt("malformed access stamp".to_string()))?,
            ),
            None => None,
        };

        Ok(census)
    }

    /// Number of stored entries.
    pub fn len(&self) -> StoreResult<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.metas.len(&rtxn)?)
    }

    /// True if the store holds no entries.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    // == Close ==
    /// Flushes and closes the environment, waiting until it is released.
    pub fn close(self) -> StoreResult<()> {
        self.env.force_sync()?;
        let path = self.path;
        self.env.prepare_for_closing().wait();
        info!("Durable store at {} closed", path.display());
        Ok(())
    }

    // == Internal Helpers ==
    fn read_meta(&self, txn: &RoTxn, encoded: &[u8]) -> StoreResult<Option<EntryMeta>> {
        match self.metas.get(txn, encoded)? {
            Some(bytes) => EntryMeta::decode(bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt("malformed entry metadata".to_string())),
            None => Ok(None),
        }
    }

    /// Bytes held by live pages of the four databases.
    fn used_bytes(&self, txn: &RoTxn) -> StoreResult<u64> {
        let mut used = 0u64;
        for db in [&self.payloads, &self.metas, &self.access, &self.generations] {
            let stat = db.stat(txn)?;
            let pages = stat.branch_pages + stat.leaf_pages + stat.overflow_pages;
            used += pages as u64 * u64::from(stat.page_size);
        }
        Ok(used)
    }

    fn collect_prefix(&self, txn: &RoTxn, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, EntryMeta)>> {
        let mut found = Vec::new();
        for item in self.metas.prefix_iter(txn, prefix)? {
            let (key_bytes, meta_bytes) = item?;
            let meta = EntryMeta::decode(meta_bytes)
                .ok_or_else(|| StoreError::Corrupt("malformed entry metadata".to_string()))?;
            found.push((key_bytes.to_vec(), meta));
        }
        Ok(found)
    }

    fn remove_entries(
        &self,
        wtxn: &mut RwTxn,
        doomed: &[(Vec<u8>, EntryMeta)],
    ) -> StoreResult<Removed> {
        let mut removed = Removed::default();
        for (encoded, meta) in doomed {
            self.payloads.delete(wtxn, encoded)?;
            self.metas.delete(wtxn, encoded)?;
            self.access.delete(wtxn, &meta.stamp.encode())?;
            removed.add(meta.size_bytes);
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

//! Cache Entry Module
//!
//! Defines the composite cache key, the per-entry metadata row and the
//! monotonic access clock used to order entries for LRU eviction.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::cache::MAX_KEY_LENGTH;
use crate::error::{CacheError, Result};

// == Cache Key ==
/// Composite key `(table, tenant_id, freshness, bind)` identifying one entry.
///
/// # Binary Format
///
/// Each component is written as a 4-byte big-endian length followed by its
/// UTF-8 bytes, in the order table, tenant, freshness, bind. Because every
/// component is length-prefixed, the encoding of `(table)`, `(table, tenant)`
/// and `(table, tenant, freshness)` is an exact byte prefix of every key
/// beneath it, which is what the store's prefix scans rely on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table: String,
    pub tenant_id: String,
    pub freshness: String,
    pub bind: String,
}

impl CacheKey {
    // == Constructor ==
    /// Creates a key, rejecting empty components and keys too long to store.
    pub fn new(
        table: impl Into<String>,
        tenant_id: impl Into<String>,
        freshness: impl Into<String>,
        bind: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            table: table.into(),
            tenant_id: tenant_id.into(),
            freshness: freshness.into(),
            bind: bind.into(),
        };

        for (name, value) in [
            ("table", &key.table),
            ("tenant_id", &key.tenant_id),
            ("freshness", &key.freshness),
            ("bind", &key.bind),
        ] {
            if value.is_empty() {
                return Err(CacheError::InvalidArgument(format!("{} cannot be empty", name)));
            }
        }

        let encoded_len = key.encoded_len();
        if encoded_len > MAX_KEY_LENGTH {
            return Err(CacheError::InvalidArgument(format!(
                "Key exceeds maximum encoded length of {} bytes ({} bytes)",
                MAX_KEY_LENGTH, encoded_len
            )));
        }

        Ok(key)
    }

    fn encoded_len(&self) -> usize {
        16 + self.table.len() + self.tenant_id.len() + self.freshness.len() + self.bind.len()
    }

    // == Encode ==
    /// Encodes the key for storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        push_component(&mut bytes, &self.table);
        push_component(&mut bytes, &self.tenant_id);
        push_component(&mut bytes, &self.freshness);
        push_component(&mut bytes, &self.bind);
        bytes
    }

    // == Decode ==
    /// Decodes a stored key. Returns `None` for malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut rest = bytes;
        let table = take_component(&mut rest)?;
        let tenant_id = take_component(&mut rest)?;
        let freshness = take_component(&mut rest)?;
        let bind = take_component(&mut rest)?;
        if !rest.is_empty() {
            return None;
        }
        Some(Self {
            table,
            tenant_id,
            freshness,
            bind,
        })
    }

    /// Prefix shared by every key of `table`.
    pub fn table_prefix(table: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + table.len());
        push_component(&mut bytes, table);
        bytes
    }

    /// Prefix shared by every key of one `(table, tenant)` pair.
    ///
    /// Also used verbatim as the key of the pair's generation record.
    pub fn pair_prefix(table: &str, tenant_id: &str) -> Vec<u8> {
        let mut bytes = Self::table_prefix(table);
        push_component(&mut bytes, tenant_id);
        bytes
    }

    /// Prefix shared by every key of one generation of a pair.
    pub fn generation_prefix(table: &str, tenant_id: &str, freshness: &str) -> Vec<u8> {
        let mut bytes = Self::pair_prefix(table, tenant_id);
        push_component(&mut bytes, freshness);
        bytes
    }

    /// Decodes a generation record key back into `(table, tenant)`.
    pub fn decode_pair(bytes: &[u8]) -> Option<(String, String)> {
        let mut rest = bytes;
        let table = take_component(&mut rest)?;
        let tenant_id = take_component(&mut rest)?;
        rest.is_empty().then_some((table, tenant_id))
    }
}

fn push_component(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn take_component(rest: &mut &[u8]) -> Option<String> {
    if rest.len() < 4 {
        return None;
    }
    let (len_bytes, tail) = rest.split_at(4);
    let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
    if tail.len() < len {
        return None;
    }
    let (value, tail) = tail.split_at(len);
    *rest = tail;
    String::from_utf8(value.to_vec()).ok()
}

// == Access Stamp ==
/// Position of an entry in access order.
///
/// Ordered by `last_access` first and insertion `seq` second, so entries
/// with equal access times are evicted in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AccessStamp {
    /// Microseconds since the Unix epoch, strictly increasing per process
    pub last_access: u64,
    /// Insertion sequence number
    pub seq: u64,
}

impl AccessStamp {
    /// Big-endian encoding; byte order equals access order.
    pub fn encode(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.last_access.to_be_bytes());
        bytes[8..].copy_from_slice(&self.seq.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        Some(Self {
            last_access: u64::from_be_bytes(bytes[..8].try_into().ok()?),
            seq: u64::from_be_bytes(bytes[8..].try_into().ok()?),
        })
    }
}

// == Entry Meta ==
/// Metadata row stored next to each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub size_bytes: u64,
    pub stamp: AccessStamp,
}

impl EntryMeta {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..8].copy_from_slice(&self.size_bytes.to_le_bytes());
        bytes[8..].copy_from_slice(&self.stamp.encode());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            size_bytes: u64::from_le_bytes(bytes[..8].try_into().ok()?),
            stamp: AccessStamp::decode(&bytes[8..])?,
        })
    }
}

// == Access Clock ==
/// Hands out access times and insertion sequence numbers.
///
/// Access times follow the wall clock but never repeat or go backwards
/// within one clock, even across a wall-clock step back.
#[derive(Debug, Default)]
pub struct AccessClock {
    last: AtomicU64,
    next_seq: AtomicU64,
}

impl AccessClock {
    /// Creates a clock that continues after the newest stamp found on disk.
    pub fn resume_after(latest: Option<AccessStamp>, max_seq: u64) -> Self {
        Self {
            last: AtomicU64::new(latest.map(|s| s.last_access).unwrap_or(0)),
            next_seq: AtomicU64::new(max_seq.saturating_add(1)),
        }
    }

    /// Next access time, strictly greater than every earlier one.
    pub fn tick(&self) -> u64 {
        let now = current_timestamp_us();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Stamp for a freshly written entry.
    pub fn insertion(&self) -> AccessStamp {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        AccessStamp {
            last_access: self.tick(),
            seq,
        }
    }

    /// Stamp for an entry read again, keeping its insertion order.
    pub fn refresh(&self, previous: AccessStamp) -> AccessStamp {
        AccessStamp {
            last_access: self.tick(),
            seq: previous.seq,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in microseconds.
pub fn current_timestamp_us() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

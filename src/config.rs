//! Configuration Module
//!
//! Engine parameters passed to `Init`, and the process configuration the
//! `sqcache` binary loads from environment variables.

use std::env;
use std::path::PathBuf;

use crate::error::{CacheError, Result};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

// == Cache Config ==
/// Parameters of one cache engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Directory holding the store files
    pub base_dir: PathBuf,
    /// Resident size that triggers eviction
    pub max_size_bytes: u64,
    /// Fraction of `max_size_bytes` an eviction pass drives down to
    pub cap_ratio: f64,
    /// LMDB map size override; derived from `max_size_bytes` when unset
    pub map_size: Option<usize>,
    /// Flush every commit to disk.
    ///
    /// A `get` hit commits the refreshed access time too, so with this set
    /// every hit pays for a flush as well as every write.
    pub sync_writes: bool,
}

impl CacheConfig {
    pub fn new(base_dir: impl Into<PathBuf>, max_size_bytes: u64, cap_ratio: f64) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_size_bytes,
            cap_ratio,
            map_size: None,
            sync_writes: true,
        }
    }

    /// Builds a config from a size in megabytes, as both transports send it.
    ///
    /// A negative size is kept as zero so `validate` rejects it.
    pub fn from_megabytes(base_dir: impl Into<PathBuf>, max_size_mb: i64, cap_ratio: f64) -> Self {
        let max_size_bytes = u64::try_from(max_size_mb)
            .unwrap_or(0)
            .saturating_mul(BYTES_PER_MEGABYTE);
        Self::new(base_dir, max_size_bytes, cap_ratio)
    }

    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = Some(map_size);
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    // == Validation ==
    /// Checks parameter ranges. Directory usability is checked on open.
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(CacheError::InvalidArgument(
                "base_dir cannot be empty".to_string(),
            ));
        }
        if self.max_size_bytes == 0 {
            return Err(CacheError::InvalidArgument(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if !(self.cap_ratio > 0.0 && self.cap_ratio <= 1.0) {
            return Err(CacheError::InvalidArgument(format!(
                "cap must be in (0, 1], got {}",
                self.cap_ratio
            )));
        }
        Ok(())
    }
}

// == Process Config ==
/// Settings of the `sqcache` process.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine initialised at start-up when set
    pub base_dir: Option<PathBuf>,
    /// Maximum cache size in megabytes for start-up initialisation
    pub max_size_mb: i64,
    /// Eviction target ratio for start-up initialisation
    pub cap_ratio: f64,
    /// Flush every commit to disk
    pub sync_writes: bool,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SQCACHE_BASE_DIR` - Initialise an engine at start-up (default: unset)
    /// - `SQCACHE_MAX_SIZE_MB` - Maximum cache size in MB (default: 100)
    /// - `SQCACHE_CAP` - Eviction target ratio (default: 0.8)
    /// - `SQCACHE_SYNC` - Sync every commit, including the access-time
    ///   refresh of each hit (default: true; `false` suits read-heavy caches)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_dir: env::var("SQCACHE_BASE_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            max_size_mb: env::var("SQCACHE_MAX_SIZE_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_size_mb),
            cap_ratio: env::var("SQCACHE_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cap_ratio),
            sync_writes: env::var("SQCACHE_SYNC")
                .ok()
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.sync_writes),
        }
    }

    /// Engine parameters for start-up initialisation, if a base dir is set.
    pub fn startup_cache(&self) -> Option<CacheConfig> {
        self.base_dir.as_ref().map(|dir| {
            CacheConfig::from_megabytes(dir.clone(), self.max_size_mb, self.cap_ratio)
                .with_sync_writes(self.sync_writes)
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_size_mb: 100,
            cap_ratio: 0.8,
            sync_writes: true,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

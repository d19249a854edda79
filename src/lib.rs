//! sqcache - A local disk-backed content cache
//!
//! Stores opaque payloads keyed by `(table, tenant_id, freshness, bind)`,
//! bounded by a configured size with LRU eviction down to `max * cap`.
//! Writing a new freshness tag for a `(table, tenant_id)` pair invalidates
//! every entry of the previous tag.
//!
//! The engine is reachable in-process through [`CacheEngine`], over a JSON
//! line protocol (the `sqcache` binary), and through a C ABI.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod ffi;
pub mod models;

pub use api::AppState;
pub use cache::{CacheEngine, CacheStats};
pub use config::{CacheConfig, Config};
pub use error::{CacheError, StatusCode};

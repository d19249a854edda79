//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror. Every failure the engine
//! reports falls into one [`CacheError`] kind, and every kind maps to one
//! stable [`StatusCode`] shared by both transports.

use thiserror::Error;

use crate::cache::StoreError;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Bad or missing key components, out-of-range parameters
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation issued outside the `Ready` state
    #[error("Cache not initialized: {0}")]
    NotInitialized(String),

    /// Cache miss
    #[error("Cache entry not found")]
    NotFound,

    /// The storage medium ran out of space during a write
    #[error("Disk full: {0}")]
    DiskExhausted(String),

    /// Anything else, e.g. corruption or an unexpected I/O failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Returns the transport status code for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheError::InvalidArgument(_) => StatusCode::InvalidArgument,
            CacheError::NotInitialized(_) => StatusCode::NotInitialized,
            CacheError::NotFound => StatusCode::NotFound,
            CacheError::DiskExhausted(_) => StatusCode::DiskFull,
            CacheError::Internal(_) => StatusCode::General,
        }
    }

    /// True for a plain cache miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}

// == Store Error Classification ==
impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DiskExhausted(msg) => CacheError::DiskExhausted(msg),
            other => CacheError::Internal(other.to_string()),
        }
    }
}

// == Status Codes ==
/// Stable status codes shared by the line protocol and the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Success = 1,
    General = 0,
    DiskFull = -1,
    InvalidArgument = -2,
    NotFound = -3,
    NotInitialized = -4,
}

impl StatusCode {
    /// Raw integer value as seen by clients.
    pub fn code(self) -> i32 {
        self as i32
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

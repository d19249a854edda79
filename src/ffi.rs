//! C ABI
//!
//! Exports `Init`, `Get`, `Set`, `Delete`, `Close` and `FreeMem` over one
//! process-wide engine for callers loading the `cdylib`. Every function
//! returns a status code (see [`StatusCode`]) and never unwinds across the
//! boundary.
//!
//! # Buffers
//!
//! `Get` returns a buffer allocated by this library. The caller copies
//! `*out_len` bytes out of it and then hands it back to `FreeMem` exactly
//! once. The allocation carries an 8-byte length header placed just before
//! the returned pointer, so `FreeMem` needs only the pointer.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_double, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use once_cell::sync::Lazy;
use tracing::error;

use crate::cache::CacheEngine;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result, StatusCode};

/// Process-wide engine behind the C ABI.
static ENGINE: Lazy<CacheEngine> = Lazy::new(CacheEngine::new);

const HEADER_LEN: usize = std::mem::size_of::<u64>();

// =============================================================================
// Exported Functions
// =============================================================================

/// Opens the cache in `base_dir` with a maximum size of `max_size` megabytes
/// and an eviction target of `max_size * cap`.
///
/// # Safety
/// `base_dir` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn Init(base_dir: *const c_char, max_size: c_int, cap: c_double) -> c_int {
    guarded(|| {
        let base_dir = read_str(base_dir, "base_dir")?;
        ENGINE.init(CacheConfig::from_megabytes(base_dir, i64::from(max_size), cap))
    })
}

/// Looks up an entry.
///
/// On a hit returns a buffer holding `*out_len` bytes (possibly zero). On
/// failure returns null and stores the status code in `*out_len`; a miss
/// stores `ERROR_NOT_FOUND`.
///
/// # Safety
/// String arguments must be null or valid NUL-terminated strings. `out_len`
/// must be null or point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn Get(
    table: *const c_char,
    tenant_id: *const c_char,
    freshness: *const c_char,
    bind: *const c_char,
    out_len: *mut c_int,
) -> *mut c_char {
    let result = catch_unwind(AssertUnwindSafe(|| -> Result<Vec<u8>> {
        let table = read_str(table, "table")?;
        let tenant_id = read_str(tenant_id, "tenant_id")?;
        let freshness = read_str(freshness, "freshness")?;
        let bind = read_str(bind, "bind")?;
        let payload = ENGINE.get(table, tenant_id, freshness, bind)?;
        if c_int::try_from(payload.len()).is_err() {
            return Err(CacheError::Internal(
                "payload too large for the C interface".to_string(),
            ));
        }
        Ok(payload)
    }));

    let (buffer, len) = match result {
        Ok(Ok(payload)) => {
            let len = payload.len() as c_int;
            (into_c_buffer(payload), len)
        }
        Ok(Err(err)) => (ptr::null_mut(), err.status_code().code()),
        Err(_) => {
            error!("Panic in Get");
            (ptr::null_mut(), StatusCode::General.code())
        }
    };

    if !out_len.is_null() {
        *out_len = len;
    }
    buffer
}

/// Stores `content_len` bytes from `content` under the key.
///
/// `content` may be null only when `content_len` is zero.
///
/// # Safety
/// String arguments must be null or valid NUL-terminated strings; `content`
/// must be valid for reads of `content_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn Set(
    table: *const c_char,
    tenant_id: *const c_char,
    freshness: *const c_char,
    bind: *const c_char,
    content: *const c_char,
    content_len: c_int,
) -> c_int {
    guarded(|| {
        let table = read_str(table, "table")?;
        let tenant_id = read_str(tenant_id, "tenant_id")?;
        let freshness = read_str(freshness, "freshness")?;
        let bind = read_str(bind, "bind")?;

        let len = usize::try_from(content_len).map_err(|_| {
            CacheError::InvalidArgument("content_len cannot be negative".to_string())
        })?;
        let content: &[u8] = if len == 0 {
            &[]
        } else if content.is_null() {
            return Err(CacheError::InvalidArgument("content is null".to_string()));
        } else {
            std::slice::from_raw_parts(content.cast::<u8>(), len)
        };

        ENGINE.set(table, tenant_id, freshness, bind, content)
    })
}

/// Removes every entry of `table`.
///
/// # Safety
/// `table` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn Delete(table: *const c_char) -> c_int {
    guarded(|| {
        let table = read_str(table, "table")?;
        ENGINE.delete(table).map(|_| ())
    })
}

/// Flushes and closes the cache. Later calls fail with `ERROR_NOT_INIT`.
#[no_mangle]
pub extern "C" fn Close() -> c_int {
    guarded(|| ENGINE.close())
}

/// Releases a buffer returned by `Get`. Null is ignored.
///
/// # Safety
/// `buffer` must come from `Get` and must not be used or freed afterwards.
#[no_mangle]
pub unsafe extern "C" fn FreeMem(buffer: *mut c_char) {
    if buffer.is_null() {
        return;
    }
    if catch_unwind(AssertUnwindSafe(|| free_c_buffer(buffer))).is_err() {
        error!("Panic in FreeMem");
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Runs `op`, mapping its outcome (or a panic) to a status code.
fn guarded<F>(op: F) -> c_int
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(())) => StatusCode::Success.code(),
        Ok(Err(err)) => err.status_code().code(),
        Err(_) => {
            error!("Panic crossing the C interface");
            StatusCode::General.code()
        }
    }
}

unsafe fn read_str<'a>(raw: *const c_char, name: &str) -> Result<&'a str> {
    if raw.is_null() {
        return Err(CacheError::InvalidArgument(format!("{} is null", name)));
    }
    CStr::from_ptr(raw)
        .to_str()
        .map_err(|_| CacheError::InvalidArgument(format!("{} is not valid UTF-8", name)))
}

/// Moves `payload` into a heap buffer prefixed with its length.
fn into_c_buffer(payload: Vec<u8>) -> *mut c_char {
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.extend_from_slice(&(payload.len() as u64).to_ne_bytes());
    framed.extend_from_slice(&payload);

    let base = Box::into_raw(framed.into_boxed_slice()).cast::<u8>();
    // SAFETY: the allocation is at least HEADER_LEN bytes long.
    unsafe { base.add(HEADER_LEN).cast::<c_char>() }
}

/// Reclaims a buffer produced by [`into_c_buffer`].
unsafe fn free_c_buffer(buffer: *mut c_char) {
    let base = buffer.cast::<u8>().sub(HEADER_LEN);
    let mut header = [0u8; HEADER_LEN];
    ptr::copy_nonoverlapping(base, header.as_mut_ptr(), HEADER_LEN);
    let len = u64::from_ne_bytes(header) as usize;

    let framed = ptr::slice_from_raw_parts_mut(base, HEADER_LEN + len);
    drop(Box::from_raw(framed));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use tempfile::TempDir;

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_buffer_round_trip() {
        let buffer = into_c_buffer(b"payload".to_vec());
        let bytes = unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), 7) };
        assert_eq!(bytes, b"payload");
        unsafe { FreeMem(buffer) };

        let empty = into_c_buffer(Vec::new());
        assert!(!empty.is_null());
        unsafe { FreeMem(empty) };

        unsafe { FreeMem(ptr::null_mut()) };
    }

    // The exported functions share one engine, so its whole lifecycle is
    // exercised in a single test.
    #[test]
    fn test_exported_lifecycle() {
        let dir = TempDir::new().unwrap();
        let base = cstr(dir.path().join("cache").to_str().unwrap());
        let (t, x, g, b) = (cstr("t"), cstr("x"), cstr("g"), cstr("b"));

        unsafe {
            // before Init
            let mut len: c_int = 0;
            let buffer = Get(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), &mut len);
            assert!(buffer.is_null());
            assert_eq!(len, StatusCode::NotInitialized.code());
            assert_eq!(Delete(t.as_ptr()), StatusCode::NotInitialized.code());

            // bad parameters
            assert_eq!(Init(ptr::null(), 1, 0.5), StatusCode::InvalidArgument.code());
            assert_eq!(Init(base.as_ptr(), 0, 0.5), StatusCode::InvalidArgument.code());
            assert_eq!(Init(base.as_ptr(), 1, 1.5), StatusCode::InvalidArgument.code());

            assert_eq!(Init(base.as_ptr(), 1, 0.5), StatusCode::Success.code());
            assert_eq!(Init(base.as_ptr(), 1, 0.5), StatusCode::InvalidArgument.code());

            // set and get
            let content = b"hello";
            assert_eq!(
                Set(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), content.as_ptr().cast(), 5),
                StatusCode::Success.code()
            );
            let buffer = Get(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), &mut len);
            assert!(!buffer.is_null());
            assert_eq!(len, 5);
            assert_eq!(std::slice::from_raw_parts(buffer.cast::<u8>(), 5), content);
            FreeMem(buffer);

            // empty content is a hit with zero length
            let empty = cstr("empty");
            assert_eq!(
                Set(t.as_ptr(), x.as_ptr(), g.as_ptr(), empty.as_ptr(), ptr::null(), 0),
                StatusCode::Success.code()
            );
            let buffer = Get(t.as_ptr(), x.as_ptr(), g.as_ptr(), empty.as_ptr(), &mut len);
            assert!(!buffer.is_null());
            assert_eq!(len, 0);
            FreeMem(buffer);

            // invalid content arguments
            assert_eq!(
                Set(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), ptr::null(), 3),
                StatusCode::InvalidArgument.code()
            );
            assert_eq!(
                Set(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), content.as_ptr().cast(), -1),
                StatusCode::InvalidArgument.code()
            );

            // miss
            let missing = cstr("missing");
            let buffer = Get(t.as_ptr(), x.as_ptr(), g.as_ptr(), missing.as_ptr(), &mut len);
            assert!(buffer.is_null());
            assert_eq!(len, StatusCode::NotFound.code());

            // delete
            assert_eq!(Delete(t.as_ptr()), StatusCode::Success.code());
            let buffer = Get(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), &mut len);
            assert!(buffer.is_null());
            assert_eq!(len, StatusCode::NotFound.code());

            // close
            assert_eq!(Close(), StatusCode::Success.code());
            assert_eq!(Close(), StatusCode::NotInitialized.code());
            assert_eq!(
                Set(t.as_ptr(), x.as_ptr(), g.as_ptr(), b.as_ptr(), content.as_ptr().cast(), 5),
                StatusCode::NotInitialized.code()
            );
        }
    }
}

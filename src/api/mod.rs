//! API Module
//!
//! Line protocol served over stdin/stdout.
//!
//! # Commands
//! - `INIT {"base_dir", "max_size", "cap"}` - Open the cache (`max_size` in MB)
//! - `GET {"table", "tenant_id", "freshness", "bind"}` - Fetch an entry
//! - `SET {"table", "tenant_id", "freshness", "bind", "content"}` - Store an entry
//! - `DELETE {"table"}` - Remove every entry of a table
//! - `CLOSE` - Close the cache

pub mod handlers;
pub mod session;

pub use handlers::*;
pub use session::serve;

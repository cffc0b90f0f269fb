//! Named, versioned response stores and the caching strategies built on them.
//!
//! - `storage`: synchronous SQLite backend holding every named store
//! - `registry`: async, shareable handle over the backend
//! - `layer`: network-first, cache-first and stale-while-revalidate
//! - `traits`: request keys, cached entries and served-response metadata

mod layer;
mod registry;
mod storage;
mod traits;

pub use layer::{CacheLayer, Strategy};
pub use registry::StoreRegistry;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedEntry, RequestKey, ResponseSource, Served};

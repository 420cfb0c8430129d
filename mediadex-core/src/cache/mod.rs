//! In-memory cache of stored object summaries.

pub mod object;
pub mod store;

pub use object::{CacheEntry, CacheObject};
pub use store::{STORAGE_CACHE_CAPACITY, STORAGE_CACHE_MAXFILL, StorageCache};

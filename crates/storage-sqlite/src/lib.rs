//! SQLite persistence for the Cadence local cache.
//!
//! Provides the durable [`CacheStore`](cadence_core::cache::CacheStore) backend used
//! by the engine: a single `cache_entries` table keyed by cache key, migrated on open.

pub mod cache;
pub mod db;
pub mod errors;
pub mod schema;

pub use cache::SqliteCacheStore;
pub use errors::{Result, StorageError};

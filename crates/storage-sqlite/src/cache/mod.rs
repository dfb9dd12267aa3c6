//! SQLite persistence for the engine's local cache.

mod model;
mod repository;

pub use model::CacheEntryDB;
pub use repository::SqliteCacheStore;

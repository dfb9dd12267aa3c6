//! Repository implementing the engine's `CacheStore` on SQLite.

use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;

use cadence_core::cache::CacheStore;

use crate::db::{create_pool, get_connection, run_migrations, DbPool};
use crate::errors::{Result, StorageError};
use crate::schema::cache_entries;

use super::model::CacheEntryDB;

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn like_prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Durable key-value store backing the snapshot and manifest cache.
pub struct SqliteCacheStore {
    pool: Arc<DbPool>,
}

impl SqliteCacheStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the cache database at `db_path` and migrate it.
    pub fn open(db_path: &str) -> Result<Self> {
        let pool = create_pool(db_path)?;
        run_migrations(&pool)?;
        Ok(Self::new(pool))
    }

    pub fn get_entry(&self, key_value: &str) -> Result<Option<CacheEntryDB>> {
        let mut conn = get_connection(&self.pool)?;
        let row = cache_entries::table
            .find(key_value)
            .select(CacheEntryDB::as_select())
            .first::<CacheEntryDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row)
    }

    pub fn upsert_entry(&self, key_value: &str, value_text: &str) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        let now = Utc::now().to_rfc3339();
        let row = CacheEntryDB {
            key: key_value.to_string(),
            value: value_text.to_string(),
            updated_at: now.clone(),
        };

        diesel::insert_into(cache_entries::table)
            .values(&row)
            .on_conflict(cache_entries::key)
            .do_update()
            .set((
                cache_entries::value.eq(value_text),
                cache_entries::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .map_err(StorageError::from)?;

        Ok(())
    }

    pub fn delete_entry(&self, key_value: &str) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let deleted = diesel::delete(cache_entries::table.find(key_value))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(deleted)
    }

    pub fn delete_entries_with_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        conn.transaction::<usize, StorageError, _>(|conn| {
            // LIKE is case-insensitive in SQLite; narrow in Rust before deleting.
            let keys = cache_entries::table
                .select(cache_entries::key)
                .filter(cache_entries::key.like(like_prefix_pattern(prefix)).escape('\\'))
                .load::<String>(conn)?
                .into_iter()
                .filter(|key| key.starts_with(prefix))
                .collect::<Vec<_>>();
            if keys.is_empty() {
                return Ok(0);
            }
            let deleted = diesel::delete(cache_entries::table.filter(cache_entries::key.eq_any(&keys)))
                .execute(conn)?;
            Ok(deleted)
        })
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> cadence_core::Result<Option<String>> {
        Ok(self.get_entry(key)?.map(|row| row.value))
    }

    fn put(&self, key: &str, value: &str) -> cadence_core::Result<()> {
        Ok(self.upsert_entry(key, value)?)
    }

    fn delete(&self, key: &str) -> cadence_core::Result<()> {
        self.delete_entry(key)?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> cadence_core::Result<usize> {
        Ok(self.delete_entries_with_prefix(prefix)?)
    }
}

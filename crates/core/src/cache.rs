//! Durable local cache with per-record expiry.
//!
//! [`CacheStore`] is a plain string key-value backend (SQLite in
//! `cadence-storage-sqlite`, memory here). [`LocalCache`] layers typed, timestamped
//! records on top of it. Cache trouble never fails the caller: unreadable or expired
//! records are misses, failed writes are logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::entity::{EntityKey, EntityKind};
use crate::errors::{Error, Result};
use crate::sync::{EntityManifest, Snapshot, MANIFEST_TTL_SECS, SNAPSHOT_TTL_SECS};

const SNAPSHOT_PREFIX: &str = "snapshot:";
const MANIFEST_PREFIX: &str = "manifest:";

/// Key-value persistence backend.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Delete every record whose key starts with `prefix`; returns the count removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Process-lifetime backend, used when no durable store is configured.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::cache("Memory cache lock is poisoned"))
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedRecord<T> {
    stored_at: DateTime<Utc>,
    value: T,
}

/// Hit/miss counters exposed through engine metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub snapshot_hits: u64,
    pub snapshot_misses: u64,
    pub manifest_hits: u64,
    pub manifest_misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Typed TTL cache for entity snapshots and detail manifests.
///
/// Keys are scoped by workspace (`snapshot:<workspace>/<collection>`), so several
/// workspaces can share one durable store.
pub struct LocalCache {
    store: Arc<dyn CacheStore>,
    scope: Option<String>,
    clock: Arc<dyn Clock>,
    snapshot_ttl: Duration,
    manifest_ttl: Duration,
    snapshots: Counters,
    manifests: Counters,
}

impl LocalCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            scope: None,
            clock,
            snapshot_ttl: Duration::seconds(SNAPSHOT_TTL_SECS as i64),
            manifest_ttl: Duration::seconds(MANIFEST_TTL_SECS as i64),
            snapshots: Counters::default(),
            manifests: Counters::default(),
        }
    }

    /// Scope every key to one workspace.
    pub fn with_scope(mut self, workspace: impl Into<String>) -> Self {
        self.scope = Some(workspace.into());
        self
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn scoped(&self, prefix: &str, rest: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{}{}/{}", prefix, scope, rest),
            None => format!("{}{}", prefix, rest),
        }
    }

    fn snapshot_key(&self, collection: &str) -> String {
        self.scoped(SNAPSHOT_PREFIX, collection)
    }

    fn manifest_key(&self, key: &EntityKey) -> String {
        self.scoped(MANIFEST_PREFIX, &key.to_string())
    }

    pub fn with_ttls(mut self, snapshot_ttl: Duration, manifest_ttl: Duration) -> Self {
        self.snapshot_ttl = snapshot_ttl;
        self.manifest_ttl = manifest_ttl;
        self
    }

    fn read<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("[LocalCache] Read of '{}' failed: {}", key, err);
                return None;
            }
        };

        let record = match serde_json::from_str::<CachedRecord<T>>(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!("[LocalCache] Dropping undecodable record '{}': {}", key, err);
                self.remove(key);
                return None;
            }
        };

        if self.clock.now() - record.stored_at > ttl {
            debug!(
                "[LocalCache] Record '{}' expired (stored_at={})",
                key, record.stored_at
            );
            self.remove(key);
            return None;
        }
        Some(record.value)
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let record = CachedRecord {
            stored_at: self.clock.now(),
            value,
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("[LocalCache] Failed to encode '{}': {}", key, err);
                return false;
            }
        };
        match self.store.put(key, &encoded) {
            Ok(()) => true,
            Err(err) => {
                warn!("[LocalCache] Write of '{}' failed: {}", key, err);
                false
            }
        }
    }

    fn remove(&self, key: &str) {
        if let Err(err) = self.store.delete(key) {
            warn!("[LocalCache] Delete of '{}' failed: {}", key, err);
        }
    }

    pub fn read_snapshot(&self, collection: &str) -> Option<Snapshot> {
        let snapshot = self.read(&self.snapshot_key(collection), self.snapshot_ttl);
        self.snapshots.record(snapshot.is_some());
        snapshot
    }

    /// Replace the whole snapshot record for `collection`.
    pub fn write_snapshot(&self, collection: &str, snapshot: &Snapshot) -> bool {
        self.write(&self.snapshot_key(collection), snapshot)
    }

    pub fn invalidate_snapshot(&self, collection: &str) {
        self.remove(&self.snapshot_key(collection));
    }

    pub fn read_manifest(&self, key: &EntityKey) -> Option<EntityManifest> {
        let manifest = self.read(&self.manifest_key(key), self.manifest_ttl);
        self.manifests.record(manifest.is_some());
        manifest
    }

    pub fn write_manifest(&self, manifest: &EntityManifest) -> bool {
        self.write(&self.manifest_key(&manifest.entity_key), manifest)
    }

    /// Drop cached manifests, optionally only those of one entity kind.
    pub fn invalidate_manifests(&self, kind: Option<EntityKind>) -> usize {
        let prefix = match kind {
            Some(kind) => self.scoped(MANIFEST_PREFIX, &format!("{}:", kind.as_str())),
            None => self.scoped(MANIFEST_PREFIX, ""),
        };
        match self.store.delete_prefix(&prefix) {
            Ok(count) => count,
            Err(err) => {
                warn!("[LocalCache] Manifest invalidation failed: {}", err);
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            snapshot_hits: self.snapshots.hits.load(Ordering::Relaxed),
            snapshot_misses: self.snapshots.misses.load(Ordering::Relaxed),
            manifest_hits: self.manifests.hits.load(Ordering::Relaxed),
            manifest_misses: self.manifests.misses.load(Ordering::Relaxed),
        }
    }
}

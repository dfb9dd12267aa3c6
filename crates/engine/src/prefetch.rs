//! Detail prefetch with bounded concurrency.
//!
//! Requests for the same entity share one in-flight future; fetched manifests land
//! in the short-lived manifest layer of the local cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use cadence_core::api::SyncApi;
use cadence_core::cache::LocalCache;
use cadence_core::entity::EntityKey;
use cadence_core::sync::{EntityManifest, PREFETCH_CONCURRENCY};
use cadence_core::{Error, NetworkError, Result};

type ManifestFuture = Shared<BoxFuture<'static, std::result::Result<EntityManifest, NetworkError>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchStats {
    pub fetched: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchReport {
    pub requested: usize,
    pub ready: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    fetched: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    failed: AtomicU64,
}

fn as_network_error(err: Error) -> NetworkError {
    match err {
        Error::Network(network) => network,
        other => NetworkError::transport(other.to_string(), false),
    }
}

pub struct PrefetchController {
    api: Arc<dyn SyncApi>,
    cache: Arc<LocalCache>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<EntityKey, ManifestFuture>>>,
    counters: Arc<Counters>,
}

impl PrefetchController {
    pub fn new(api: Arc<dyn SyncApi>, cache: Arc<LocalCache>) -> Self {
        Self::with_concurrency(api, cache, PREFETCH_CONCURRENCY)
    }

    pub fn with_concurrency(api: Arc<dyn SyncApi>, cache: Arc<LocalCache>, limit: usize) -> Self {
        Self {
            api,
            cache,
            permits: Arc::new(Semaphore::new(limit.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<EntityKey, ManifestFuture>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_fetch(&self, key: &EntityKey) -> ManifestFuture {
        let api = Arc::clone(&self.api);
        let cache = Arc::clone(&self.cache);
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let key = key.clone();
        async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| NetworkError::transport("prefetch controller closed", false))?;
            let manifest = api
                .fetch_manifest(&key)
                .await
                .map_err(as_network_error)?;
            cache.write_manifest(&manifest);
            counters.fetched.fetch_add(1, Ordering::Relaxed);
            Ok(manifest)
        }
        .boxed()
        .shared()
    }

    /// Manifest for `key`, from cache when fresh, otherwise fetched once for all
    /// concurrent callers.
    pub async fn get_manifest(&self, key: &EntityKey) -> Result<EntityManifest> {
        if let Some(manifest) = self.cache.read_manifest(key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(manifest);
        }

        let future = {
            let mut in_flight = self.in_flight();
            match in_flight.get(key) {
                Some(existing) => {
                    self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                    existing.clone()
                }
                None => {
                    let future = self.start_fetch(key);
                    in_flight.insert(key.clone(), future.clone());
                    future
                }
            }
        };

        let result = future.await;
        self.in_flight().remove(key);
        result.map_err(|err| {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            Error::network(err)
        })
    }

    /// Warm the manifest layer for `keys`; failures are logged, never returned.
    pub async fn prefetch(&self, keys: &[EntityKey]) -> PrefetchReport {
        let results = join_all(keys.iter().map(|key| self.get_manifest(key))).await;
        let mut report = PrefetchReport {
            requested: keys.len(),
            ..PrefetchReport::default()
        };
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(_) => report.ready += 1,
                Err(err) => {
                    warn!("[Prefetch] Manifest for {} failed: {}", key, err);
                    report.failed += 1;
                }
            }
        }
        debug!(
            "[Prefetch] Warmed {}/{} manifests",
            report.ready, report.requested
        );
        report
    }

    pub fn stats(&self) -> PrefetchStats {
        PrefetchStats {
            fetched: self.counters.fetched.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

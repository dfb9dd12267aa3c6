//! Periodic drift detection against the server's freshness tokens.
//!
//! Runs independently of the push channel: a missed push (or a push channel that
//! never connected) is caught here within one interval.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use cadence_core::api::{DiffQuery, SyncApi};
use cadence_core::cache::LocalCache;
use cadence_core::entity::{EntityKey, EntityKind};
use cadence_core::sync::{
    ProbeOutcome, SyncBroadcast, SyncCycleTrigger, RECONCILE_REQUEST_TIMEOUT_SECS,
};
use cadence_core::{Error, Result};

use crate::broadcast::CrossTabBroadcast;
use crate::lease::ActionLock;
use crate::store::StateStore;

/// UI collaborator that refreshes views bound to a resource class.
#[async_trait]
pub trait ResourceReloader: Send + Sync {
    async fn reload(&self, resource: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub trigger: SyncCycleTrigger,
    /// The tick did nothing: an edit lease was held or another tick was running.
    pub skipped: bool,
    pub unchanged: Vec<String>,
    pub changed: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    fn new(trigger: SyncCycleTrigger) -> Self {
        Self {
            trigger,
            skipped: false,
            unchanged: Vec::new(),
            changed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    pub ticks: u64,
    pub skipped: u64,
    pub changes_detected: u64,
    pub failures: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ReconciliationCycle {
    api: Arc<dyn SyncApi>,
    store: Arc<StateStore>,
    cache: Arc<LocalCache>,
    action_lock: ActionLock,
    broadcast: Arc<dyn CrossTabBroadcast>,
    reloader: Option<Arc<dyn ResourceReloader>>,
    resources: Vec<String>,
    snapshot_collection: String,
    tokens: Mutex<HashMap<String, String>>,
    request_timeout: Duration,
    cycle_mutex: tokio::sync::Mutex<()>,
    stats: Mutex<ReconcileStats>,
}

impl ReconciliationCycle {
    pub fn new(
        api: Arc<dyn SyncApi>,
        store: Arc<StateStore>,
        cache: Arc<LocalCache>,
        action_lock: ActionLock,
        broadcast: Arc<dyn CrossTabBroadcast>,
    ) -> Self {
        Self {
            api,
            store,
            cache,
            action_lock,
            broadcast,
            reloader: None,
            resources: vec![
                EntityKind::Session.collection().to_string(),
                EntityKind::Task.collection().to_string(),
            ],
            snapshot_collection: EntityKind::Session.collection().to_string(),
            tokens: Mutex::new(HashMap::new()),
            request_timeout: Duration::from_secs(RECONCILE_REQUEST_TIMEOUT_SECS),
            cycle_mutex: tokio::sync::Mutex::new(()),
            stats: Mutex::new(ReconcileStats::default()),
        }
    }

    pub fn with_reloader(mut self, reloader: Arc<dyn ResourceReloader>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    /// Collection name the painted snapshot is persisted under.
    pub fn with_snapshot_collection(mut self, collection: impl Into<String>) -> Self {
        self.snapshot_collection = collection.into();
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Record the freshness token last seen for `resource`.
    pub fn seed_token(&self, resource: &str, etag: Option<String>) {
        let mut tokens = lock(&self.tokens);
        match etag {
            Some(etag) => {
                tokens.insert(resource.to_string(), etag);
            }
            None => {
                tokens.remove(resource);
            }
        }
    }

    pub fn token(&self, resource: &str) -> Option<String> {
        lock(&self.tokens).get(resource).cloned()
    }

    pub fn stats(&self) -> ReconcileStats {
        *lock(&self.stats)
    }

    async fn bounded<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }

    /// Full fetch of one resource class; returns the token to remember.
    async fn resync(&self, resource: &str, header_etag: Option<String>) -> Result<Option<String>> {
        let diff = self
            .bounded(self.api.fetch_diff(resource, &DiffQuery::full()))
            .await?;

        let mut deletes = diff.deletes.clone();
        if let Some(kind) = EntityKind::from_collection(resource) {
            let present: HashSet<&EntityKey> = diff.upserts.iter().map(|e| &e.key).collect();
            deletes.extend(
                self.store
                    .keys_of_kind(kind)
                    .into_iter()
                    .filter(|key| !present.contains(key)),
            );
            self.cache.invalidate_manifests(Some(kind));
        }
        let etag = header_etag.or_else(|| diff.etag.clone());
        let upserted = diff.upserts.len();
        self.store.apply_diff(diff.upserts, deletes);
        // The persisted snapshot holds every kind; refresh it so the next paint
        // starts from post-drift state.
        if !self
            .cache
            .write_snapshot(&self.snapshot_collection, &self.store.snapshot())
        {
            self.cache.invalidate_snapshot(&self.snapshot_collection);
        }

        if let Some(reloader) = &self.reloader {
            if let Err(err) = reloader.reload(resource).await {
                warn!("[Reconcile] Reload of '{}' failed: {}", resource, err);
            }
        }
        self.broadcast.publish(SyncBroadcast::ResourceChanged {
            resource: resource.to_string(),
            etag: etag.clone(),
        });
        info!(
            "[Reconcile] '{}' drifted; re-synced {} record(s)",
            resource, upserted
        );
        Ok(etag)
    }

    async fn check(&self, resource: &str) -> Result<bool> {
        let token = self.token(resource);
        let probe = self
            .bounded(self.api.probe_header(resource, token.as_deref()))
            .await?;
        match probe {
            ProbeOutcome::NotModified => Ok(false),
            ProbeOutcome::Modified(header) => {
                let etag = self.resync(resource, header.etag).await?;
                self.seed_token(resource, etag);
                Ok(true)
            }
        }
    }

    /// One reconciliation pass over every tracked resource.
    pub async fn run_once(&self, trigger: SyncCycleTrigger) -> ReconcileReport {
        let mut report = ReconcileReport::new(trigger);

        if self.action_lock.is_held() {
            debug!("[Reconcile] Edit in flight; skipping {:?} tick", trigger);
            report.skipped = true;
            lock(&self.stats).skipped += 1;
            return report;
        }
        let Ok(_cycle) = self.cycle_mutex.try_lock() else {
            debug!("[Reconcile] Previous tick still running; skipping {:?}", trigger);
            report.skipped = true;
            lock(&self.stats).skipped += 1;
            return report;
        };

        for resource in &self.resources {
            match self.check(resource).await {
                Ok(true) => report.changed.push(resource.clone()),
                Ok(false) => report.unchanged.push(resource.clone()),
                Err(err) => {
                    warn!("[Reconcile] Check of '{}' failed: {}", resource, err);
                    report.failed.push(resource.clone());
                }
            }
        }

        let mut stats = lock(&self.stats);
        stats.ticks += 1;
        stats.changes_detected += report.changed.len() as u64;
        stats.failures += report.failed.len() as u64;
        report
    }

    /// Spawn the periodic loop. The caller owns the handle and aborts it to stop.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cycle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; bootstrap already synced.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cycle.run_once(SyncCycleTrigger::Periodic).await;
            }
        })
    }
}

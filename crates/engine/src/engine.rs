//! Bootstrap orchestrator.
//!
//! `SyncEngine` wires the cache, store, channel, queue, resolver, reconciliation
//! cycle and prefetch controller together and drives the startup path from cold
//! to live. Background work (diff fetch, reconciliation timer, queue drain) is
//! owned by this instance and torn down by `shutdown`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use cadence_core::api::{DiffQuery, PushTransport, SyncApi};
use cadence_core::cache::{CacheStats, CacheStore, LocalCache, MemoryCacheStore};
use cadence_core::clock::{Clock, SystemClock};
use cadence_core::entity::EntityKey;
use cadence_core::grouping::Filter;
use cadence_core::sync::{
    DiffResponse, MutationKind, OfflineOperation, ProbeOutcome, SyncBroadcast, SyncCycleTrigger,
    ACTION_LEASE_TTL_SECS,
};
use cadence_core::{Error, Result};
use cadence_storage_sqlite::{db, SqliteCacheStore};
use cadence_sync_client::SyncApiClient;

use crate::broadcast::{CrossTabBroadcast, LocalBroadcastHub};
use crate::channel::{ChannelState, ChannelStats, EventChannel};
use crate::config::SyncEngineConfig;
use crate::conflict::{ConflictMetrics, ConflictPrompt, ConflictResolver};
use crate::lease::{ActionLease, ActionLock};
use crate::prefetch::{PrefetchController, PrefetchStats};
use crate::queue::{ConnectivityFlag, ConnectivityMonitor, DrainReport, OfflineQueue};
use crate::reconcile::{ReconcileReport, ReconcileStats, ReconciliationCycle, ResourceReloader};
use crate::store::{StateStore, StoreEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStep {
    PaintFromCache,
    OpenChannel,
    ProbeHeader,
    FetchDiff,
    MarkLive,
    Prefetch,
    InstallReconciliation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step: BootstrapStep,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReport {
    pub steps: Vec<StepReport>,
    pub cache_hit: bool,
    pub cached_entities: usize,
    pub fetched_diff: bool,
    pub replayed_events: usize,
    pub prefetched: usize,
}

impl BootstrapReport {
    fn record(&mut self, step: BootstrapStep, outcome: std::result::Result<String, String>) {
        let (ok, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(detail) => {
                warn!("[SyncEngine] Bootstrap step {:?} failed: {}", step, detail);
                (false, detail)
            }
        };
        self.steps.push(StepReport {
            step,
            ok,
            detail: (!detail.is_empty()).then_some(detail),
        });
    }

    pub fn step(&self, step: BootstrapStep) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.step == step)
    }

    pub fn all_ok(&self) -> bool {
        self.steps.iter().all(|report| report.ok)
    }
}

/// Point-in-time engine status for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub cache: CacheStats,
    pub conflicts: ConflictMetrics,
    pub channel: ChannelStats,
    pub channel_state: ChannelState,
    pub pending_mutations: usize,
    pub dead_letters: usize,
    pub unresolved_conflicts: usize,
    pub entities: usize,
    pub last_event_id: u64,
    pub reconcile: ReconcileStats,
    pub prefetch: PrefetchStats,
    pub last_bootstrap: Option<BootstrapReport>,
}

/// Handles for the background work owned by one engine instance.
struct EngineRuntimeState {
    diff_task: Mutex<Option<JoinHandle<()>>>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    diff_generation: AtomicU64,
    shut_down: AtomicBool,
    visible: AtomicBool,
    last_bootstrap: StdMutex<Option<BootstrapReport>>,
}

impl EngineRuntimeState {
    fn new() -> Self {
        Self {
            diff_task: Mutex::new(None),
            reconcile_task: Mutex::new(None),
            drain_task: Mutex::new(None),
            diff_generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            visible: AtomicBool::new(true),
            last_bootstrap: StdMutex::new(None),
        }
    }
}

async fn abort_slot(slot: &Mutex<Option<JoinHandle<()>>>) -> bool {
    match slot.lock().await.take() {
        Some(handle) => {
            handle.abort();
            true
        }
        None => false,
    }
}

async fn slot_running(slot: &Mutex<Option<JoinHandle<()>>>) -> bool {
    slot.lock()
        .await
        .as_ref()
        .is_some_and(|handle| !handle.is_finished())
}

#[derive(Default)]
pub struct SyncEngineBuilder {
    config: SyncEngineConfig,
    api: Option<Arc<dyn SyncApi>>,
    transport: Option<Arc<dyn PushTransport>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    clock: Option<Arc<dyn Clock>>,
    prompt: Option<Arc<dyn ConflictPrompt>>,
    reloader: Option<Arc<dyn ResourceReloader>>,
    connectivity: Option<Arc<ConnectivityFlag>>,
    broadcast: Option<Arc<dyn CrossTabBroadcast>>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncEngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn api(mut self, api: Arc<dyn SyncApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn reloader(mut self, reloader: Arc<dyn ResourceReloader>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<ConnectivityFlag>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn broadcast(mut self, broadcast: Arc<dyn CrossTabBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    fn http_api(config: &SyncEngineConfig) -> Result<Arc<dyn SyncApi>> {
        let url = config.api_url.as_deref().ok_or_else(|| {
            Error::invalid_request("sync engine requires a network api or an api url")
        })?;
        let mut client = SyncApiClient::new(url)?;
        if let Some(token) = config.api_token.as_deref() {
            client = client.with_token(token);
        }
        info!("[SyncEngine] Using HTTP api at {}", client.base_url());
        Ok(Arc::new(client))
    }

    fn open_cache_store(config: &SyncEngineConfig) -> Arc<dyn CacheStore> {
        let Some(dir) = config.cache_path.as_deref() else {
            return Arc::new(MemoryCacheStore::new());
        };
        let opened = db::init(dir)
            .map_err(|e| Error::cache(e.to_string()))
            .and_then(|path| SqliteCacheStore::open(&path).map_err(Error::from));
        match opened {
            Ok(store) => {
                info!("[SyncEngine] Using SQLite cache in {}", dir);
                Arc::new(store)
            }
            Err(err) => {
                warn!(
                    "[SyncEngine] Could not open cache in {} ({}); falling back to memory",
                    dir, err
                );
                Arc::new(MemoryCacheStore::new())
            }
        }
    }

    pub fn build(self) -> Result<SyncEngine> {
        let config = self.config;
        let api = match self.api {
            Some(api) => api,
            None => Self::http_api(&config)?,
        };
        let transport = self
            .transport
            .ok_or_else(|| Error::invalid_request("sync engine requires a push transport"))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache_store = self
            .cache_store
            .unwrap_or_else(|| Self::open_cache_store(&config));
        let cache = Arc::new(
            LocalCache::new(cache_store, Arc::clone(&clock)).with_scope(config.workspace.clone()),
        );
        let broadcast = self
            .broadcast
            .unwrap_or_else(|| Arc::new(LocalBroadcastHub::default()));
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(ConnectivityFlag::new(true)));

        let store = Arc::new(StateStore::new(Arc::clone(&clock)));
        store.set_filter(config.filter);

        let mut resolver = ConflictResolver::new(Arc::clone(&store))
            .with_broadcast(Arc::clone(&broadcast))
            .with_auto_merge_fields(config.auto_merge_fields.clone())
            .with_prompt_timeout(config.prompt_timeout);
        if let Some(prompt) = self.prompt {
            resolver = resolver.with_prompt(prompt);
        }
        let resolver = Arc::new(resolver);

        let queue = Arc::new(
            OfflineQueue::new(
                Arc::clone(&api),
                Arc::clone(&store),
                Arc::clone(&resolver),
                connectivity.clone(),
                Arc::clone(&clock),
            )
            .with_max_attempts(config.max_attempts),
        );

        let channel = Arc::new(EventChannel::new(
            config.namespace(),
            transport,
            Arc::clone(&store),
        ));

        let action_lock = ActionLock::new(Arc::clone(&clock));
        let mut reconcile = ReconciliationCycle::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&cache),
            action_lock.clone(),
            Arc::clone(&broadcast),
        )
        .with_resources(config.tracked_resources.clone())
        .with_snapshot_collection(config.collection.clone())
        .with_request_timeout(config.request_timeout);
        if let Some(reloader) = self.reloader {
            reconcile = reconcile.with_reloader(reloader);
        }

        let prefetch = Arc::new(PrefetchController::with_concurrency(
            Arc::clone(&api),
            Arc::clone(&cache),
            config.prefetch_concurrency,
        ));

        Ok(SyncEngine {
            config: Arc::new(config),
            api,
            cache,
            store,
            channel,
            queue,
            resolver,
            reconcile: Arc::new(reconcile),
            prefetch,
            action_lock,
            broadcast,
            connectivity,
            runtime: Arc::new(EngineRuntimeState::new()),
        })
    }
}

/// One sync engine per workspace session, passed explicitly to consumers.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncEngineConfig>,
    api: Arc<dyn SyncApi>,
    cache: Arc<LocalCache>,
    store: Arc<StateStore>,
    channel: Arc<EventChannel>,
    queue: Arc<OfflineQueue>,
    resolver: Arc<ConflictResolver>,
    reconcile: Arc<ReconciliationCycle>,
    prefetch: Arc<PrefetchController>,
    action_lock: ActionLock,
    broadcast: Arc<dyn CrossTabBroadcast>,
    connectivity: Arc<ConnectivityFlag>,
    runtime: Arc<EngineRuntimeState>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationCycle> {
        &self.reconcile
    }

    pub fn prefetcher(&self) -> &Arc<PrefetchController> {
        &self.prefetch
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    fn collection(&self) -> &str {
        &self.config.collection
    }

    /// Cold-to-live startup. Every step runs even when an earlier one failed.
    pub async fn bootstrap(&self) -> BootstrapReport {
        self.runtime.shut_down.store(false, Ordering::SeqCst);
        abort_slot(&self.runtime.reconcile_task).await;
        info!("[SyncEngine] Bootstrapping '{}'", self.config.namespace());

        let mut report = BootstrapReport::default();

        // 1. Paint from cache.
        match self.cache.read_snapshot(self.collection()) {
            Some(snapshot) => {
                let painted = snapshot.entities.len();
                report.cache_hit = true;
                report.cached_entities = painted;
                self.store.hydrate(snapshot);
                report.record(
                    BootstrapStep::PaintFromCache,
                    Ok(format!("painted {} cached entities", painted)),
                );
            }
            None => report.record(BootstrapStep::PaintFromCache, Ok("cache miss".to_string())),
        }

        // 2. Open the channel in buffering mode.
        let outcome = self
            .channel
            .connect()
            .await
            .map(|_| format!("joining from event {}", self.store.last_event_id()))
            .map_err(|err| err.to_string());
        report.record(BootstrapStep::OpenChannel, outcome);

        // 3. Header probe with the cached token.
        let cached_etag = self.store.cursor().etag;
        let probe = match timeout(
            self.config.request_timeout,
            self.api
                .probe_header(self.collection(), cached_etag.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.request_timeout)),
        };
        let (stale, header_etag) = match probe {
            Ok(ProbeOutcome::NotModified) => {
                report.record(BootstrapStep::ProbeHeader, Ok("not modified".to_string()));
                (false, cached_etag.clone())
            }
            Ok(ProbeOutcome::Modified(header)) => {
                report.record(
                    BootstrapStep::ProbeHeader,
                    Ok(format!("modified (last event {})", header.last_event_id)),
                );
                (true, header.etag)
            }
            Err(err) => {
                let stale = !err.is_connectivity();
                report.record(BootstrapStep::ProbeHeader, Err(err.to_string()));
                (stale, None)
            }
        };

        // 4. Diff fetch when stale.
        if stale {
            let cursor = self.store.cursor();
            let query = DiffQuery {
                cursor: cursor.pagination_cursor,
                last_event_id: cursor.last_event_id,
                filter: Some(self.store.filter()),
            };
            let outcome = self
                .fetch_and_apply(query, header_etag)
                .await
                .map(|applied| format!("applied {} change(s)", applied))
                .map_err(|err| err.to_string());
            report.fetched_diff = outcome.is_ok();
            report.record(BootstrapStep::FetchDiff, outcome);
        } else {
            report.record(BootstrapStep::FetchDiff, Ok("skipped".to_string()));
        }

        // 5. Go live, replaying buffered events against the cursor.
        report.replayed_events = self.channel.mark_live();
        let live = format!(
            "replayed {} buffered event(s), channel {:?}",
            report.replayed_events,
            self.channel.state()
        );
        report.record(BootstrapStep::MarkLive, Ok(live));

        // 6. Prefetch details for the highest-priority visible entities.
        let keys = self
            .store
            .top_visible_by_priority(self.config.prefetch_top_n);
        let prefetched = self.prefetch.prefetch(&keys).await;
        report.prefetched = prefetched.ready;
        let outcome = if prefetched.failed == 0 {
            Ok(format!("{}/{} manifests", prefetched.ready, prefetched.requested))
        } else {
            Err(format!(
                "{} of {} manifests failed",
                prefetched.failed, prefetched.requested
            ))
        };
        report.record(BootstrapStep::Prefetch, outcome);

        // 7. Periodic reconciliation.
        self.reconcile
            .seed_token(self.collection(), self.store.cursor().etag);
        let handle = self.reconcile.spawn(self.config.reconcile_interval);
        if let Some(previous) = self.runtime.reconcile_task.lock().await.replace(handle) {
            previous.abort();
        }
        report.record(
            BootstrapStep::InstallReconciliation,
            Ok(format!("every {:?}", self.config.reconcile_interval)),
        );

        if self.is_online() && !self.queue.is_empty() {
            self.spawn_drain().await;
        }

        info!(
            "[SyncEngine] Bootstrap finished: cache_hit={} diff={} replayed={} prefetched={}",
            report.cache_hit, report.fetched_diff, report.replayed_events, report.prefetched
        );
        *self
            .runtime
            .last_bootstrap
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(report.clone());
        report
    }

    /// Fetch a diff on a background task tagged with a fresh generation, abort any
    /// older fetch, and apply the result unless it was superseded meanwhile.
    async fn fetch_and_apply(
        &self,
        query: DiffQuery,
        header_etag: Option<String>,
    ) -> Result<usize> {
        let generation = self.runtime.diff_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let api = Arc::clone(&self.api);
        let collection = self.collection().to_string();
        let (tx, rx) = oneshot::channel::<Result<DiffResponse>>();
        let handle = tokio::spawn(async move {
            let result = api.fetch_diff(&collection, &query).await;
            let _ = tx.send(result);
        });
        if let Some(previous) = self.runtime.diff_task.lock().await.replace(handle) {
            previous.abort();
        }

        let mut diff = rx.await.map_err(|_| Error::Cancelled)??;
        if self.runtime.diff_generation.load(Ordering::SeqCst) != generation {
            debug!(
                "[SyncEngine] Discarding diff from superseded generation {}",
                generation
            );
            return Err(Error::Cancelled);
        }

        if diff.etag.is_none() {
            diff.etag = header_etag;
        }
        let applied = diff.upserts.len() + diff.deletes.len();
        self.store.apply_fetched(diff);
        if !self
            .cache
            .write_snapshot(self.collection(), &self.store.snapshot())
        {
            warn!("[SyncEngine] Snapshot for '{}' not persisted", self.collection());
        }
        debug!(
            "[SyncEngine] Applied diff generation {} ({} change(s))",
            generation, applied
        );
        Ok(applied)
    }

    /// Switch the view filter and refetch for the new context. Returns
    /// `Err(Cancelled)` when a later filter change superseded this one.
    pub async fn set_filter(&self, filter: Filter) -> Result<()> {
        self.store.set_filter(filter);
        let query = DiffQuery {
            cursor: None,
            last_event_id: 0,
            filter: Some(filter),
        };
        let header_etag = self.store.cursor().etag;
        self.fetch_and_apply(query, header_etag).await.map(|_| ())
    }

    /// Host visibility notification; regaining the foreground reconciles at once.
    pub async fn on_visibility_change(&self, visible: bool) -> Option<ReconcileReport> {
        let was_visible = self.runtime.visible.swap(visible, Ordering::SeqCst);
        if !visible || was_visible || self.runtime.shut_down.load(Ordering::SeqCst) {
            return None;
        }
        debug!("[SyncEngine] Foregrounded; reconciling");
        Some(self.reconcile.run_once(SyncCycleTrigger::Foreground).await)
    }

    /// Host connectivity notification; the offline to online edge drains the queue.
    pub async fn on_connectivity_change(&self, online: bool) -> Option<DrainReport> {
        let was_online = self.connectivity.set(online);
        if !online || was_online {
            if !online {
                info!("[SyncEngine] Offline; mutations will queue");
            }
            return None;
        }
        info!(
            "[SyncEngine] Back online; draining {} queued mutation(s)",
            self.queue.len()
        );
        let report = self.queue.process_queue().await;
        if report.retried > 0 {
            self.spawn_drain().await;
        }
        Some(report)
    }

    /// Apply a user mutation locally and schedule delivery to the server.
    pub async fn enqueue_mutation(
        &self,
        kind: MutationKind,
        entity_key: EntityKey,
        payload: Value,
    ) -> Result<OfflineOperation> {
        let operation = self.queue.enqueue(kind, entity_key, payload)?;
        if self.is_online() {
            self.spawn_drain().await;
        }
        Ok(operation)
    }

    async fn spawn_drain(&self) {
        let mut slot = self.runtime.drain_task.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let queue = Arc::clone(&self.queue);
        *slot = Some(tokio::spawn(async move {
            loop {
                let report = queue.process_queue().await;
                if report.skipped || report.halted.is_some() || report.retried == 0 {
                    break;
                }
                let Some(delay) = queue.next_retry_delay() else {
                    break;
                };
                debug!(
                    "[SyncEngine] {} mutation(s) retrying in {:?}",
                    report.retried, delay
                );
                tokio::time::sleep(delay).await;
            }
        }));
    }

    pub async fn trigger_reconciliation(&self) -> ReconcileReport {
        self.reconcile.run_once(SyncCycleTrigger::Manual).await
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(callback)
    }

    pub fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.watch()
    }

    pub fn watch_broadcasts(&self) -> broadcast::Receiver<SyncBroadcast> {
        self.broadcast.subscribe()
    }

    /// Mark an edit in progress; reconciliation ticks skip while it is held.
    pub fn acquire_action_lease(&self, holder: impl Into<String>) -> ActionLease {
        let ttl = chrono::Duration::from_std(self.config.action_lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(ACTION_LEASE_TTL_SECS as i64));
        self.action_lock.acquire(holder, ttl)
    }

    pub fn metrics(&self) -> EngineMetrics {
        let cursor = self.store.cursor();
        EngineMetrics {
            cache: self.cache.stats(),
            conflicts: self.resolver.metrics(),
            channel: self.channel.stats(),
            channel_state: self.channel.state(),
            pending_mutations: self.queue.len(),
            dead_letters: self.queue.dead_letters().len(),
            unresolved_conflicts: self.queue.unresolved_conflicts().len(),
            entities: self.store.len(),
            last_event_id: cursor.last_event_id,
            reconcile: self.reconcile.stats(),
            prefetch: self.prefetch.stats(),
            last_bootstrap: self
                .runtime
                .last_bootstrap
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }

    /// Number of background tasks this instance currently has running.
    pub async fn active_background_tasks(&self) -> usize {
        let mut running = 0;
        for slot in [
            &self.runtime.diff_task,
            &self.runtime.reconcile_task,
            &self.runtime.drain_task,
        ] {
            if slot_running(slot).await {
                running += 1;
            }
        }
        running
    }

    /// Stop all background work. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.runtime.shut_down.swap(true, Ordering::SeqCst) {
            debug!("[SyncEngine] Already shut down");
            return;
        }
        // Any diff still in flight now belongs to a stale generation.
        self.runtime.diff_generation.fetch_add(1, Ordering::SeqCst);
        let mut aborted = 0;
        for slot in [
            &self.runtime.diff_task,
            &self.runtime.reconcile_task,
            &self.runtime.drain_task,
        ] {
            if abort_slot(slot).await {
                aborted += 1;
            }
        }
        self.channel.disconnect().await;
        info!(
            "[SyncEngine] Shut down '{}' ({} task(s) stopped)",
            self.config.namespace(),
            aborted
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeSyncApi, MemoryPushTransport};
    use cadence_core::entity::EntityRecord;
    use std::time::Duration;

    fn engine_with(api: Arc<FakeSyncApi>) -> SyncEngine {
        SyncEngine::builder()
            .api(api)
            .transport(Arc::new(MemoryPushTransport::new()))
            .build()
            .expect("engine")
    }

    #[test]
    fn build_requires_api_and_transport() {
        let missing_api = SyncEngine::builder()
            .transport(Arc::new(MemoryPushTransport::new()))
            .build();
        assert!(matches!(missing_api, Err(Error::InvalidRequest(_))));

        let missing_transport = SyncEngine::builder()
            .api(Arc::new(FakeSyncApi::new()))
            .build();
        assert!(matches!(missing_transport, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn api_url_builds_http_client() {
        let config = SyncEngineConfig {
            api_url: Some("http://127.0.0.1:9/".to_string()),
            ..SyncEngineConfig::default()
        };
        let engine = SyncEngine::builder()
            .config(config)
            .transport(Arc::new(MemoryPushTransport::new()))
            .build();
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn cache_path_selects_sqlite_store() {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        let config = SyncEngineConfig {
            cache_path: Some(dir.to_string_lossy().to_string()),
            ..SyncEngineConfig::default()
        };
        let engine = SyncEngine::builder()
            .config(config)
            .api(Arc::new(FakeSyncApi::new()))
            .transport(Arc::new(MemoryPushTransport::new()))
            .build()
            .expect("engine");

        engine.store().upsert(EntityRecord::new(EntityKey::session("s-1")));
        assert!(engine
            .cache()
            .write_snapshot("sessions", &engine.store().snapshot()));
        assert!(dir.join(db::DB_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn superseded_filter_change_is_cancelled() {
        let api = Arc::new(FakeSyncApi::new());
        api.set_delay(Some(Duration::from_millis(50)));
        let engine = engine_with(api.clone());

        let first = engine.set_filter(Filter {
            show_archived: true,
            ..Filter::default()
        });
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.set_filter(Filter::default()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first, Err(Error::Cancelled)));
        assert!(second.is_ok());
        assert_eq!(engine.store().filter(), Filter::default());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = engine_with(Arc::new(FakeSyncApi::new()));
        engine.bootstrap().await;
        assert!(engine.active_background_tasks().await >= 1);

        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.active_background_tasks().await, 0);
        assert_eq!(engine.channel().state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn visibility_only_reconciles_on_foreground_edge() {
        let engine = engine_with(Arc::new(FakeSyncApi::new()));
        assert!(engine.on_visibility_change(true).await.is_none());
        assert!(engine.on_visibility_change(false).await.is_none());
        let report = engine
            .on_visibility_change(true)
            .await
            .expect("foreground reconcile");
        assert_eq!(report.trigger, SyncCycleTrigger::Foreground);
    }
}

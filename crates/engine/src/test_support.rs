//! In-memory collaborators for tests: a scripted network API, a push transport
//! driven from the test body, and canned UI collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use cadence_core::api::{DiffQuery, JoinRequest, PushTransport, SyncApi, TransportEvent};
use cadence_core::entity::EntityKey;
use cadence_core::sync::{
    CollectionHeader, ConflictRecord, DiffResponse, EntityManifest, EventEnvelope, PatchOutcome,
    PatchRequest, ProbeOutcome,
};
use cadence_core::{Error, NetworkError, Result};

use crate::conflict::{ConflictPrompt, PromptChoice};
use crate::reconcile::ResourceReloader;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn offline_error() -> Error {
    Error::network(NetworkError::transport("connection refused", true))
}

/// Scripted reply for one `patch_entity` call.
#[derive(Debug, Clone)]
pub enum PatchReply {
    Outcome(PatchOutcome),
    Fail(NetworkError),
}

#[derive(Default)]
struct FakeApiState {
    headers: HashMap<String, CollectionHeader>,
    diffs: HashMap<String, VecDeque<DiffResponse>>,
    default_diffs: HashMap<String, DiffResponse>,
    patch_replies: VecDeque<PatchReply>,
    manifests: HashMap<EntityKey, EntityManifest>,
    probe_calls: Vec<(String, Option<String>)>,
    diff_calls: Vec<(String, DiffQuery)>,
    patch_calls: Vec<(EntityKey, PatchRequest)>,
    manifest_calls: Vec<EntityKey>,
    applied_tokens: HashSet<String>,
    delay: Option<Duration>,
}

/// Scripted [`SyncApi`]. Unscripted calls succeed with empty results.
#[derive(Default)]
pub struct FakeSyncApi {
    state: Mutex<FakeApiState>,
    offline: AtomicBool,
}

impl FakeSyncApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&self, collection: &str, etag: &str, last_event_id: u64) {
        lock(&self.state).headers.insert(
            collection.to_string(),
            CollectionHeader {
                total: 0,
                etag: Some(etag.to_string()),
                last_event_id,
            },
        );
    }

    /// Queue a diff returned once, ahead of the default diff.
    pub fn push_diff(&self, collection: &str, diff: DiffResponse) {
        lock(&self.state)
            .diffs
            .entry(collection.to_string())
            .or_default()
            .push_back(diff);
    }

    pub fn set_default_diff(&self, collection: &str, diff: DiffResponse) {
        lock(&self.state)
            .default_diffs
            .insert(collection.to_string(), diff);
    }

    pub fn push_patch_reply(&self, reply: PatchReply) {
        lock(&self.state).patch_replies.push_back(reply);
    }

    pub fn set_manifest(&self, manifest: EntityManifest) {
        lock(&self.state)
            .manifests
            .insert(manifest.entity_key.clone(), manifest);
    }

    /// Delay every call, to exercise timeouts and in-flight de-duplication.
    pub fn set_delay(&self, delay: Option<Duration>) {
        lock(&self.state).delay = delay;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn probe_calls(&self) -> Vec<(String, Option<String>)> {
        lock(&self.state).probe_calls.clone()
    }

    pub fn diff_calls(&self) -> Vec<(String, DiffQuery)> {
        lock(&self.state).diff_calls.clone()
    }

    pub fn patch_calls(&self) -> Vec<(EntityKey, PatchRequest)> {
        lock(&self.state).patch_calls.clone()
    }

    pub fn manifest_calls(&self) -> Vec<EntityKey> {
        lock(&self.state).manifest_calls.clone()
    }

    /// Distinct idempotency tokens the fake server has applied.
    pub fn applied_tokens(&self) -> HashSet<String> {
        lock(&self.state).applied_tokens.clone()
    }

    async fn before_call(&self) -> Result<()> {
        let delay = lock(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(offline_error());
        }
        Ok(())
    }
}

#[async_trait]
impl SyncApi for FakeSyncApi {
    async fn fetch_header(&self, collection: &str) -> Result<CollectionHeader> {
        self.before_call().await?;
        Ok(lock(&self.state)
            .headers
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn probe_header(&self, collection: &str, etag: Option<&str>) -> Result<ProbeOutcome> {
        self.before_call().await?;
        let mut state = lock(&self.state);
        state
            .probe_calls
            .push((collection.to_string(), etag.map(str::to_string)));
        let header = state.headers.get(collection).cloned().unwrap_or_default();
        match (etag, header.etag.as_deref()) {
            (Some(sent), Some(current)) if sent == current => Ok(ProbeOutcome::NotModified),
            _ => Ok(ProbeOutcome::Modified(header)),
        }
    }

    async fn fetch_diff(&self, collection: &str, query: &DiffQuery) -> Result<DiffResponse> {
        self.before_call().await?;
        let mut state = lock(&self.state);
        state
            .diff_calls
            .push((collection.to_string(), query.clone()));
        if let Some(diff) = state
            .diffs
            .get_mut(collection)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(diff);
        }
        Ok(state
            .default_diffs
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn patch_entity(&self, key: &EntityKey, request: &PatchRequest) -> Result<PatchOutcome> {
        self.before_call().await?;
        let mut state = lock(&self.state);
        state.patch_calls.push((key.clone(), request.clone()));
        match state.patch_replies.pop_front() {
            Some(PatchReply::Fail(err)) => Err(Error::network(err)),
            Some(PatchReply::Outcome(outcome)) => {
                if matches!(outcome, PatchOutcome::Applied(_)) {
                    state
                        .applied_tokens
                        .insert(request.idempotency_token.clone());
                }
                Ok(outcome)
            }
            None => {
                state
                    .applied_tokens
                    .insert(request.idempotency_token.clone());
                Ok(PatchOutcome::Applied(None))
            }
        }
    }

    async fn fetch_manifest(&self, key: &EntityKey) -> Result<EntityManifest> {
        self.before_call().await?;
        let mut state = lock(&self.state);
        state.manifest_calls.push(key.clone());
        Ok(state
            .manifests
            .get(key)
            .cloned()
            .unwrap_or_else(|| EntityManifest {
                entity_key: key.clone(),
                etag: None,
                detail: Default::default(),
            }))
    }
}

/// Push transport whose events are injected by the test.
#[derive(Default)]
pub struct MemoryPushTransport {
    sender: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    joins: Mutex<Vec<JoinRequest>>,
    opens: Mutex<usize>,
    closed: AtomicBool,
}

impl MemoryPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the channel; false when no connection is open.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let sender = lock(&self.sender).clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn emit_envelope(&self, envelope: EventEnvelope) -> bool {
        self.emit(TransportEvent::Envelope(envelope)).await
    }

    pub fn joins(&self) -> Vec<JoinRequest> {
        lock(&self.joins).clone()
    }

    pub fn open_count(&self) -> usize {
        *lock(&self.opens)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for MemoryPushTransport {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.opens) += 1;
        self.closed.store(false, Ordering::SeqCst);
        *lock(&self.sender) = Some(tx);
        Ok(rx)
    }

    async fn join(&self, request: JoinRequest) -> Result<()> {
        lock(&self.joins).push(request);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.sender).take();
    }
}

enum PromptScript {
    Silent,
    Answer(PromptChoice),
    Dismiss,
}

/// Conflict prompt with a fixed behaviour.
pub struct ScriptedPrompt {
    script: PromptScript,
    asked: Mutex<Vec<ConflictRecord>>,
}

impl ScriptedPrompt {
    /// Never answers.
    pub fn silent() -> Self {
        Self::with_script(PromptScript::Silent)
    }

    pub fn answering(choice: PromptChoice) -> Self {
        Self::with_script(PromptScript::Answer(choice))
    }

    pub fn dismissing() -> Self {
        Self::with_script(PromptScript::Dismiss)
    }

    fn with_script(script: PromptScript) -> Self {
        Self {
            script,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> usize {
        lock(&self.asked).len()
    }
}

#[async_trait]
impl ConflictPrompt for ScriptedPrompt {
    async fn choose(&self, conflict: &ConflictRecord) -> Result<Option<PromptChoice>> {
        lock(&self.asked).push(conflict.clone());
        match self.script {
            PromptScript::Silent => std::future::pending().await,
            PromptScript::Answer(choice) => Ok(Some(choice)),
            PromptScript::Dismiss => Ok(None),
        }
    }
}

/// Reloader that records which resources it was asked to refresh.
#[derive(Default)]
pub struct RecordingReloader {
    reloaded: Mutex<Vec<String>>,
}

impl RecordingReloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reloaded(&self) -> Vec<String> {
        lock(&self.reloaded).clone()
    }
}

#[async_trait]
impl ResourceReloader for RecordingReloader {
    async fn reload(&self, resource: &str) -> Result<()> {
        lock(&self.reloaded).push(resource.to_string());
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

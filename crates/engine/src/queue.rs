//! Offline mutation queue.
//!
//! User mutations are applied optimistically to the state store and recorded
//! with a client-generated idempotency token. `process_queue` replays them to the
//! server in FIFO order; an operation leaves the queue only once the server has
//! confirmed it, or once the conflict it ran into has been resolved. Conflicts the
//! resolver gives up on stay queued and are retried on the next drain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use cadence_core::api::SyncApi;
use cadence_core::clock::Clock;
use cadence_core::entity::{EntityKey, EntityRecord, EntityStatus};
use cadence_core::sync::{
    backoff_seconds, ConflictRecord, MutationKind, OfflineOperation, PatchOutcome, PatchRequest,
    RetryClass, QUEUE_RETRY_JITTER_MS,
};
use cadence_core::{Error, Result};

use crate::conflict::{diff_payload, ConflictResolver, ResolutionOutcome};
use crate::store::StateStore;

/// Reports whether the client currently believes it is online.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag flipped by the host's online/offline notifications.
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    /// Returns the previous value.
    pub fn set(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::SeqCst)
    }
}

impl ConnectivityMonitor for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a drain stopped before reaching the end of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainHalt {
    Offline,
    ReauthRequired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Another drain was already running.
    pub skipped: bool,
    pub sent: usize,
    pub conflicts: usize,
    /// Conflicts left pending because no resolution was reached.
    pub unresolved: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub remaining: usize,
    pub halted: Option<DrainHalt>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-progress flag when a drain ends, even if it was cancelled.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OfflineQueue {
    api: Arc<dyn SyncApi>,
    store: Arc<StateStore>,
    resolver: Arc<ConflictResolver>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    pending: Mutex<VecDeque<OfflineOperation>>,
    dead_letters: Mutex<Vec<OfflineOperation>>,
    unresolved: Mutex<HashMap<String, ConflictRecord>>,
    draining: AtomicBool,
    max_attempts: Option<u32>,
}

impl OfflineQueue {
    pub fn new(
        api: Arc<dyn SyncApi>,
        store: Arc<StateStore>,
        resolver: Arc<ConflictResolver>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            store,
            resolver,
            connectivity,
            clock,
            pending: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            unresolved: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            max_attempts: None,
        }
    }

    /// Dead-letter retryable operations after this many failed attempts.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The record the store should hold once `kind` has been applied locally.
    fn optimistic_result(
        &self,
        kind: MutationKind,
        key: &EntityKey,
        payload: &Value,
    ) -> Result<Option<EntityRecord>> {
        let fields = || {
            payload.as_object().ok_or_else(|| {
                Error::invalid_request(format!(
                    "{} payload for {} must be an object",
                    kind.as_str(),
                    key
                ))
            })
        };
        match kind {
            MutationKind::Create => {
                let mut record = EntityRecord::new(key.clone());
                record.merge_payload(fields()?)?;
                Ok(Some(record))
            }
            MutationKind::Update => {
                let fields = fields()?;
                match self.store.get(key) {
                    Some(mut record) => {
                        record.merge_payload(fields)?;
                        Ok(Some(record))
                    }
                    None => {
                        debug!(
                            "[OfflineQueue] {} not loaded; update queued without local apply",
                            key
                        );
                        Ok(None)
                    }
                }
            }
            MutationKind::Archive => Ok(self.store.get(key).map(|mut record| {
                record.status = EntityStatus::Archived;
                record
            })),
            MutationKind::Delete => Ok(None),
        }
    }

    /// Record a mutation and apply it to the store immediately.
    pub fn enqueue(
        &self,
        kind: MutationKind,
        entity_key: EntityKey,
        payload: Value,
    ) -> Result<OfflineOperation> {
        let optimistic = self.optimistic_result(kind, &entity_key, &payload)?;

        let operation = OfflineOperation {
            kind,
            entity_key,
            payload,
            idempotency_token: Uuid::new_v4().to_string(),
            attempts: 0,
            last_error: None,
            enqueued_at: self.clock.now(),
        };
        lock(&self.pending).push_back(operation.clone());

        match (kind, optimistic) {
            (MutationKind::Delete, _) => self.store.remove(&operation.entity_key),
            (_, Some(record)) => self.store.upsert(record),
            (_, None) => {}
        }
        debug!(
            "[OfflineQueue] Queued {} for {} (token={})",
            kind.as_str(),
            operation.entity_key,
            operation.idempotency_token
        );
        Ok(operation)
    }

    pub fn pending(&self) -> Vec<OfflineOperation> {
        lock(&self.pending).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<OfflineOperation> {
        lock(&self.dead_letters).clone()
    }

    /// Conflicts whose operation is still queued because resolution failed.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        lock(&self.unresolved).values().cloned().collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn remove(&self, token: &str) -> Option<OfflineOperation> {
        lock(&self.unresolved).remove(token);
        let mut pending = lock(&self.pending);
        let index = pending
            .iter()
            .position(|op| op.idempotency_token == token)?;
        pending.remove(index)
    }

    /// Bump the attempt count; returns the updated count.
    fn record_failure(&self, token: &str, error: &Error) -> u32 {
        let mut pending = lock(&self.pending);
        match pending.iter_mut().find(|op| op.idempotency_token == token) {
            Some(op) => {
                op.attempts += 1;
                op.last_error = Some(error.to_string());
                op.attempts
            }
            None => 0,
        }
    }

    /// Keep a conflicted operation queued and remember the conflict it hit.
    fn hold_unresolved(&self, conflict: ConflictRecord, token: &str, reason: &str) {
        if let Some(op) = lock(&self.pending)
            .iter_mut()
            .find(|op| op.idempotency_token == token)
        {
            op.last_error = Some(format!("unresolved conflict: {}", reason));
        }
        warn!(
            "[OfflineQueue] Conflict on {} unresolved ({}); keeping it queued",
            conflict.entity_key, reason
        );
        lock(&self.unresolved).insert(token.to_string(), conflict);
    }

    fn dead_letter(&self, token: &str, error: &Error) {
        if let Some(mut op) = self.remove(token) {
            op.last_error = Some(error.to_string());
            warn!(
                "[OfflineQueue] Giving up on {} for {} after {} attempt(s): {}",
                op.kind.as_str(),
                op.entity_key,
                op.attempts,
                error
            );
            lock(&self.dead_letters).push(op);
        }
    }

    fn next_unattempted(&self, attempted: &HashSet<String>) -> Option<OfflineOperation> {
        lock(&self.pending)
            .iter()
            .find(|op| !attempted.contains(&op.idempotency_token))
            .cloned()
    }

    /// Replay queued operations in order. Only one drain runs at a time.
    pub async fn process_queue(&self) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[OfflineQueue] Drain already in progress");
            return DrainReport {
                skipped: true,
                remaining: self.len(),
                ..DrainReport::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        let mut attempted = HashSet::new();

        while let Some(op) = self.next_unattempted(&attempted) {
            if !self.connectivity.is_online() {
                report.halted = Some(DrainHalt::Offline);
                break;
            }
            attempted.insert(op.idempotency_token.clone());

            let request = PatchRequest {
                action: op.kind,
                payload: op.payload.clone(),
                idempotency_token: op.idempotency_token.clone(),
            };
            match self.api.patch_entity(&op.entity_key, &request).await {
                Ok(PatchOutcome::Applied(server_version)) => {
                    self.remove(&op.idempotency_token);
                    report.sent += 1;
                    if let Some(server_version) = server_version {
                        self.store.upsert(server_version);
                    }
                }
                Ok(PatchOutcome::Conflict(conflict)) => {
                    report.conflicts += 1;
                    let server_version = conflict.server_version.clone();
                    match self.resolver.handle_conflict(conflict.clone()).await {
                        ResolutionOutcome::Resolved {
                            resolved,
                            needs_push,
                            ..
                        } => {
                            self.remove(&op.idempotency_token);
                            if needs_push {
                                self.requeue_resolution(&server_version, &resolved);
                            }
                        }
                        ResolutionOutcome::Failed { reason } => {
                            self.hold_unresolved(conflict, &op.idempotency_token, &reason);
                            report.unresolved += 1;
                        }
                    }
                }
                Err(err) if err.is_connectivity() => {
                    info!(
                        "[OfflineQueue] Connectivity lost while sending {}: {}",
                        op.entity_key, err
                    );
                    report.halted = Some(DrainHalt::Offline);
                    break;
                }
                Err(err) => match err.retry_class() {
                    RetryClass::Permanent => {
                        self.dead_letter(&op.idempotency_token, &err);
                        report.dead_lettered += 1;
                    }
                    RetryClass::ReauthRequired => {
                        self.record_failure(&op.idempotency_token, &err);
                        warn!("[OfflineQueue] Authorization required, pausing drain: {}", err);
                        report.halted = Some(DrainHalt::ReauthRequired);
                        break;
                    }
                    RetryClass::Retryable => {
                        let attempts = self.record_failure(&op.idempotency_token, &err);
                        if self.max_attempts.is_some_and(|max| attempts >= max) {
                            self.dead_letter(&op.idempotency_token, &err);
                            report.dead_lettered += 1;
                        } else {
                            warn!(
                                "[OfflineQueue] {} for {} failed (attempt {}), keeping it queued: {}",
                                op.kind.as_str(),
                                op.entity_key,
                                attempts,
                                err
                            );
                            report.retried += 1;
                        }
                    }
                },
            }
        }

        report.remaining = self.len();
        debug!(
            "[OfflineQueue] Drain finished sent={} conflicts={} unresolved={} retried={} dead={} remaining={}",
            report.sent,
            report.conflicts,
            report.unresolved,
            report.retried,
            report.dead_lettered,
            report.remaining
        );
        report
    }

    /// Push a locally-won resolution back to the server as a plain update.
    fn requeue_resolution(&self, server_version: &EntityRecord, resolved: &EntityRecord) {
        let payload = diff_payload(server_version, resolved);
        if payload.is_empty() {
            return;
        }
        let operation = OfflineOperation {
            kind: MutationKind::Update,
            entity_key: resolved.key.clone(),
            payload: Value::Object(payload),
            idempotency_token: Uuid::new_v4().to_string(),
            attempts: 0,
            last_error: None,
            enqueued_at: self.clock.now(),
        };
        debug!(
            "[OfflineQueue] Re-queued resolved version of {} (token={})",
            operation.entity_key, operation.idempotency_token
        );
        lock(&self.pending).push_back(operation);
    }

    /// Delay before the next automatic retry, with jitter. `None` when nothing waits.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let attempts = lock(&self.pending)
            .iter()
            .filter(|op| op.attempts > 0)
            .map(|op| op.attempts)
            .min()?;
        let jitter_ms = rand::thread_rng().gen_range(0..=QUEUE_RETRY_JITTER_MS);
        let backoff = Duration::from_secs(backoff_seconds(attempts.saturating_sub(1)));
        Some(backoff + Duration::from_millis(jitter_ms))
    }
}

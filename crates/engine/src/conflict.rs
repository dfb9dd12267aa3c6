//! Version conflict resolution.
//!
//! Strategies are tried in order: field-level auto-merge for non-critical fields,
//! last-write-wins on `updated_at`, then an explicit user choice with a hard
//! timeout. Whatever wins is written through [`ConflictResolver::apply_resolution`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cadence_core::entity::{EntityKey, EntityRecord};
use cadence_core::sync::{
    server_wins_lww, ConflictRecord, ResolutionMethod, SyncBroadcast,
    USER_RESOLUTION_TIMEOUT_SECS,
};
use cadence_core::{Error, Result};

use crate::broadcast::CrossTabBroadcast;
use crate::store::StateStore;

/// Fields that may be auto-merged without asking the user.
pub const DEFAULT_AUTO_MERGE_FIELDS: [&str; 5] =
    ["labels", "description", "category", "tags", "notes"];

const TYPED_FIELDS: [&str; 3] = ["status", "priority", "starts_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptChoice {
    KeepLocal,
    KeepServer,
    Merge,
}

/// UI collaborator asked to pick a side when no automatic strategy applies.
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    /// `Ok(None)` means the user dismissed the prompt.
    async fn choose(&self, conflict: &ConflictRecord) -> Result<Option<PromptChoice>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    Resolved {
        method: ResolutionMethod,
        resolved: EntityRecord,
        /// The winning version differs from the server's and must be pushed.
        needs_push: bool,
    },
    Failed {
        reason: String,
    },
}

impl ResolutionOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMetrics {
    pub total: u64,
    pub auto_resolved: u64,
    pub user_resolved: u64,
    pub failed: u64,
    pub auto_resolution_rate: f64,
}

pub struct ConflictResolver {
    store: Arc<StateStore>,
    broadcast: Option<Arc<dyn CrossTabBroadcast>>,
    prompt: Option<Arc<dyn ConflictPrompt>>,
    auto_merge_fields: BTreeSet<String>,
    prompt_timeout: Duration,
    metrics: Mutex<ConflictMetrics>,
}

/// Same user-visible content, ignoring version metadata.
fn same_content(a: &EntityRecord, b: &EntityRecord) -> bool {
    a.status == b.status && a.priority == b.priority && a.starts_at == b.starts_at && a.fields == b.fields
}

/// Field payload that turns `base` into `target`. Removed fields map to null.
pub fn diff_payload(base: &EntityRecord, target: &EntityRecord) -> Map<String, Value> {
    let names: BTreeSet<&str> = TYPED_FIELDS
        .iter()
        .copied()
        .chain(base.fields.keys().map(String::as_str))
        .chain(target.fields.keys().map(String::as_str))
        .collect();
    let mut payload = Map::new();
    for name in names {
        let wanted = target.field(name);
        if base.field(name) != wanted {
            payload.insert(name.to_string(), wanted.unwrap_or(Value::Null));
        }
    }
    payload
}

fn union_arrays(local: &[Value], server: &[Value]) -> Value {
    let mut merged: Vec<Value> = Vec::with_capacity(local.len() + server.len());
    for item in local.iter().chain(server.iter()) {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    Value::Array(merged)
}

/// User-requested merge: arrays are unioned, everything else follows last-write-wins.
pub fn merge_versions(local: &EntityRecord, server: &EntityRecord) -> EntityRecord {
    let local_wins = server_wins_lww(local.updated_at, server.updated_at) == Some(false);
    let (winner, loser) = if local_wins { (local, server) } else { (server, local) };

    let mut merged = winner.clone();
    for (name, value) in &loser.fields {
        match (merged.fields.get(name), value) {
            (Some(Value::Array(kept)), Value::Array(other)) => {
                let union = if local_wins {
                    union_arrays(kept, other)
                } else {
                    union_arrays(other, kept)
                };
                merged.fields.insert(name.clone(), union);
            }
            (None, Value::Array(_)) => {
                merged.fields.insert(name.clone(), value.clone());
            }
            _ => {}
        }
    }
    merged.etag = server.etag.clone();
    merged
}

impl ConflictResolver {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            broadcast: None,
            prompt: None,
            auto_merge_fields: DEFAULT_AUTO_MERGE_FIELDS.iter().map(|f| f.to_string()).collect(),
            prompt_timeout: Duration::from_secs(USER_RESOLUTION_TIMEOUT_SECS),
            metrics: Mutex::new(ConflictMetrics::default()),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn CrossTabBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_auto_merge_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auto_merge_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    fn update_metrics(&self, apply: impl FnOnce(&mut ConflictMetrics)) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut metrics);
        let resolved = metrics.auto_resolved + metrics.user_resolved + metrics.failed;
        metrics.auto_resolution_rate = if resolved == 0 {
            0.0
        } else {
            metrics.auto_resolved as f64 / resolved as f64
        };
    }

    pub fn metrics(&self) -> ConflictMetrics {
        *self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Server values for every conflicting field, applied on top of the local version.
    fn auto_merge(&self, conflict: &ConflictRecord) -> Option<EntityRecord> {
        if conflict.conflicting_fields.is_empty()
            || !conflict
                .conflicting_fields
                .iter()
                .all(|field| self.auto_merge_fields.contains(field))
        {
            return None;
        }
        let mut merged = conflict.local_version.clone();
        for field in &conflict.conflicting_fields {
            let value = conflict.server_version.field(field).unwrap_or(Value::Null);
            if let Err(err) = merged.set_field(field, value) {
                warn!(
                    "[ConflictResolver] Auto-merge of '{}' on {} failed: {}",
                    field, conflict.entity_key, err
                );
                return None;
            }
        }
        merged.etag = conflict.server_version.etag.clone();
        merged.updated_at = conflict.server_version.updated_at;
        Some(merged)
    }

    fn by_timestamp(&self, conflict: &ConflictRecord) -> Option<EntityRecord> {
        let server_wins = server_wins_lww(
            conflict.local_version.updated_at,
            conflict.server_version.updated_at,
        )?;
        let mut winner = if server_wins {
            conflict.server_version.clone()
        } else {
            conflict.local_version.clone()
        };
        winner.etag = conflict.server_version.etag.clone();
        Some(winner)
    }

    async fn ask_user(
        &self,
        conflict: &ConflictRecord,
    ) -> std::result::Result<(ResolutionMethod, EntityRecord), String> {
        let prompt = self
            .prompt
            .as_ref()
            .ok_or_else(|| "no conflict prompt configured".to_string())?;

        let choice = match tokio::time::timeout(self.prompt_timeout, prompt.choose(conflict)).await {
            Ok(Ok(Some(choice))) => choice,
            Ok(Ok(None)) => return Err("prompt dismissed".to_string()),
            Ok(Err(err)) => return Err(format!("prompt failed: {}", err)),
            Err(_) => return Err(format!("no answer within {:?}", self.prompt_timeout)),
        };

        let resolved = match choice {
            PromptChoice::KeepLocal => {
                let mut local = conflict.local_version.clone();
                local.etag = conflict.server_version.etag.clone();
                (ResolutionMethod::UserLocal, local)
            }
            PromptChoice::KeepServer => (ResolutionMethod::UserServer, conflict.server_version.clone()),
            PromptChoice::Merge => (
                ResolutionMethod::UserMerge,
                merge_versions(&conflict.local_version, &conflict.server_version),
            ),
        };
        Ok(resolved)
    }

    pub async fn handle_conflict(&self, conflict: ConflictRecord) -> ResolutionOutcome {
        self.update_metrics(|m| m.total += 1);
        info!(
            "[ConflictResolver] Conflict on {} ({}) fields={:?}",
            conflict.entity_key, conflict.event_type, conflict.conflicting_fields
        );

        let attempt = if let Some(merged) = self.auto_merge(&conflict) {
            Ok((ResolutionMethod::AutoMerge, merged))
        } else if let Some(winner) = self.by_timestamp(&conflict) {
            Ok((ResolutionMethod::Timestamp, winner))
        } else {
            self.ask_user(&conflict).await
        };

        let (method, resolved) = match attempt {
            Ok(resolution) => resolution,
            Err(reason) => {
                warn!(
                    "[ConflictResolver] Could not resolve {}: {}",
                    conflict.entity_key, reason
                );
                self.update_metrics(|m| m.failed += 1);
                return ResolutionOutcome::Failed { reason };
            }
        };

        if let Err(err) = self.apply_resolution(&conflict.entity_key, resolved.clone(), method) {
            warn!(
                "[ConflictResolver] Applying resolution for {} failed: {}",
                conflict.entity_key, err
            );
            self.update_metrics(|m| m.failed += 1);
            return ResolutionOutcome::Failed {
                reason: err.to_string(),
            };
        }

        if method.is_automatic() {
            self.update_metrics(|m| m.auto_resolved += 1);
        } else {
            self.update_metrics(|m| m.user_resolved += 1);
        }

        let needs_push = !same_content(&resolved, &conflict.server_version);
        ResolutionOutcome::Resolved {
            method,
            resolved,
            needs_push,
        }
    }

    /// Write a resolved version into the store and announce how it was chosen.
    pub fn apply_resolution(
        &self,
        entity_key: &EntityKey,
        resolved: EntityRecord,
        method: ResolutionMethod,
    ) -> Result<()> {
        if &resolved.key != entity_key {
            return Err(Error::invalid_request(format!(
                "Resolution for {} carries key {}",
                entity_key, resolved.key
            )));
        }
        self.store.upsert(resolved);
        if let Some(broadcast) = &self.broadcast {
            broadcast.publish(SyncBroadcast::ConflictResolved {
                entity_key: entity_key.clone(),
                method,
            });
        }
        info!(
            "[ConflictResolver] Resolved {} via {:?}",
            entity_key, method
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBroadcastHub;
    use crate::test_support::ScriptedPrompt;
    use cadence_core::clock::SystemClock;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn at(value: &str) -> Option<DateTime<Utc>> {
        Some(
            DateTime::parse_from_rfc3339(value)
                .expect("timestamp")
                .with_timezone(&Utc),
        )
    }

    fn version(etag: &str, updated_at: Option<&str>, fields: Value) -> EntityRecord {
        let mut record = EntityRecord::new(EntityKey::task("t-1"));
        record.etag = Some(etag.to_string());
        record.updated_at = updated_at.and_then(at);
        if let Value::Object(map) = fields {
            record.fields = map.into_iter().collect();
        }
        record
    }

    fn conflict(local: EntityRecord, server: EntityRecord, fields: &[&str]) -> ConflictRecord {
        ConflictRecord {
            entity_key: EntityKey::task("t-1"),
            local_version: local,
            server_version: server,
            conflicting_fields: fields.iter().map(|f| f.to_string()).collect(),
            event_type: "update".to_string(),
        }
    }

    fn resolver() -> (Arc<StateStore>, ConflictResolver) {
        let store = Arc::new(StateStore::new(Arc::new(SystemClock)));
        let resolver = ConflictResolver::new(Arc::clone(&store));
        (store, resolver)
    }

    #[tokio::test]
    async fn description_conflict_auto_merges() {
        let (store, resolver) = resolver();
        let local = version("v1", None, json!({"title": "Mine", "description": "local"}));
        let server = version("v2", None, json!({"title": "Mine", "description": "server"}));

        let outcome = resolver
            .handle_conflict(conflict(local, server, &["description"]))
            .await;

        match outcome {
            ResolutionOutcome::Resolved {
                method, needs_push, ..
            } => {
                assert_eq!(method, ResolutionMethod::AutoMerge);
                assert!(!needs_push);
            }
            other => panic!("unexpected {:?}", other),
        }
        let stored = store.get(&EntityKey::task("t-1")).expect("stored");
        assert_eq!(stored.fields.get("description"), Some(&json!("server")));
        assert_eq!(stored.etag.as_deref(), Some("v2"));
        let metrics = resolver.metrics();
        assert_eq!(metrics.auto_resolved, 1);
        assert_eq!(metrics.total, 1);
    }

    #[tokio::test]
    async fn critical_field_is_never_auto_merged() {
        let (_store, resolver) = resolver();
        let mut local = version("v1", Some("2026-01-01T10:00:00Z"), json!({}));
        local.priority = 5;
        let mut server = version("v2", Some("2026-01-01T09:00:00Z"), json!({}));
        server.priority = 1;

        let outcome = resolver
            .handle_conflict(conflict(local, server, &["priority"]))
            .await;
        match outcome {
            ResolutionOutcome::Resolved {
                method,
                resolved,
                needs_push,
            } => {
                assert_eq!(method, ResolutionMethod::Timestamp);
                assert_eq!(resolved.priority, 5);
                assert_eq!(resolved.etag.as_deref(), Some("v2"));
                assert!(needs_push);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn timestamp_tie_goes_to_server() {
        let (_store, resolver) = resolver();
        let local = version("v1", Some("2026-01-01T10:00:00Z"), json!({"title": "a"}));
        let server = version("v2", Some("2026-01-01T10:00:00Z"), json!({"title": "b"}));
        let outcome = resolver
            .handle_conflict(conflict(local, server, &["title"]))
            .await;
        match outcome {
            ResolutionOutcome::Resolved { resolved, .. } => {
                assert_eq!(resolved.fields.get("title"), Some(&json!("b")))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_prompt_fails_after_timeout_without_mutation() {
        let store = Arc::new(StateStore::new(Arc::new(SystemClock)));
        let resolver = ConflictResolver::new(Arc::clone(&store))
            .with_prompt(Arc::new(ScriptedPrompt::silent()));
        let local = version("v1", None, json!({"title": "a"}));
        let server = version("v2", None, json!({"title": "b"}));

        let outcome = resolver
            .handle_conflict(conflict(local, server, &["title"]))
            .await;

        assert!(!outcome.is_resolved());
        assert!(store.get(&EntityKey::task("t-1")).is_none());
        let metrics = resolver.metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.user_resolved, 0);
    }

    #[tokio::test]
    async fn user_merge_unions_arrays_and_broadcasts() {
        let store = Arc::new(StateStore::new(Arc::new(SystemClock)));
        let hub = Arc::new(LocalBroadcastHub::default());
        let mut rx = hub.subscribe();
        let resolver = ConflictResolver::new(Arc::clone(&store))
            .with_prompt(Arc::new(ScriptedPrompt::answering(PromptChoice::Merge)))
            .with_broadcast(hub.clone());
        let local = version("v1", None, json!({"title": "mine", "attendees": ["a", "b"]}));
        let server = version("v2", None, json!({"title": "theirs", "attendees": ["b", "c"]}));

        let outcome = resolver
            .handle_conflict(conflict(local, server, &["title", "attendees"]))
            .await;

        match outcome {
            ResolutionOutcome::Resolved {
                method, resolved, ..
            } => {
                assert_eq!(method, ResolutionMethod::UserMerge);
                assert_eq!(resolved.fields.get("attendees"), Some(&json!(["a", "b", "c"])));
                assert_eq!(resolved.fields.get("title"), Some(&json!("theirs")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rx.recv().await.expect("broadcast"),
            SyncBroadcast::ConflictResolved {
                entity_key: EntityKey::task("t-1"),
                method: ResolutionMethod::UserMerge,
            }
        );
        assert_eq!(resolver.metrics().user_resolved, 1);
    }

    #[test]
    fn diff_payload_lists_changed_and_removed_fields() {
        let base = version("v2", None, json!({"title": "a", "notes": "x"}));
        let mut target = version("v2", None, json!({"title": "b"}));
        target.priority = 3;
        let payload = diff_payload(&base, &target);
        assert_eq!(payload.get("title"), Some(&json!("b")));
        assert_eq!(payload.get("notes"), Some(&Value::Null));
        assert_eq!(payload.get("priority"), Some(&json!(3)));
        assert!(!payload.contains_key("status"));
    }

    #[test]
    fn apply_resolution_rejects_mismatched_key() {
        let (_store, resolver) = resolver();
        let record = EntityRecord::new(EntityKey::task("other"));
        assert!(resolver
            .apply_resolution(&EntityKey::task("t-1"), record, ResolutionMethod::UserLocal)
            .is_err());
    }
}

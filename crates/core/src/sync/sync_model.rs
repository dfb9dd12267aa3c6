//! Sync domain models: envelopes, cursors, offline operations and conflicts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityKey, EntityRecord};
use crate::grouping::Groups;

/// Change carried by a push envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityChange {
    Upsert { entity: EntityRecord },
    Delete { entity: EntityKey },
}

impl EntityChange {
    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Upsert { entity } => &entity.key,
            Self::Delete { entity } => entity,
        }
    }
}

/// Ordered push notification for one entity change.
///
/// Envelopes are applied strictly in increasing `event_id` order; anything at or
/// below the last applied id is a duplicate or stale replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: u64,
    #[serde(flatten)]
    pub change: EntityChange,
}

impl EventEnvelope {
    pub fn upsert(event_id: u64, entity: EntityRecord) -> Self {
        Self {
            event_id,
            change: EntityChange::Upsert { entity },
        }
    }

    pub fn delete(event_id: u64, key: EntityKey) -> Self {
        Self {
            event_id,
            change: EntityChange::Delete { entity: key },
        }
    }
}

/// Resumption point for diff fetches and channel subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_event_id: u64,
    pub etag: Option<String>,
    pub pagination_cursor: Option<String>,
}

/// Mutation types accepted by the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Archive,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Archive => "archive",
        }
    }
}

/// A user mutation waiting for server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub entity_key: EntityKey,
    pub payload: Value,
    /// Stable across retries so the server can de-duplicate replays.
    pub idempotency_token: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Version conflict reported by the network collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_key: EntityKey,
    pub local_version: EntityRecord,
    pub server_version: EntityRecord,
    pub conflicting_fields: Vec<String>,
    pub event_type: String,
}

/// Persisted entity snapshot for paint-from-cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entities: Vec<EntityRecord>,
    pub groups: Groups,
    pub cursor: SyncCursor,
    pub etag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Detail payload for one entity, fetched ahead of need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityManifest {
    pub entity_key: EntityKey,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub detail: BTreeMap<String, Value>,
}

/// Collection header returned by the freshness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionHeader {
    pub total: u64,
    pub etag: Option<String>,
    pub last_event_id: u64,
}

/// Outcome of a conditional header probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The token sent with the probe still matches.
    NotModified,
    Modified(CollectionHeader),
}

/// Incremental change set returned by a diff fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResponse {
    #[serde(default)]
    pub upserts: Vec<EntityRecord>,
    #[serde(default)]
    pub deletes: Vec<EntityKey>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub last_event_id: u64,
    #[serde(default)]
    pub etag: Option<String>,
}

/// Body of a mutation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub action: MutationKind,
    pub payload: Value,
    pub idempotency_token: String,
}

/// Result of a mutation request that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    /// Accepted (or de-duplicated); carries the server version when returned.
    Applied(Option<EntityRecord>),
    Conflict(ConflictRecord),
}

/// Strategy that produced a conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    AutoMerge,
    Timestamp,
    UserLocal,
    UserServer,
    UserMerge,
}

impl ResolutionMethod {
    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::AutoMerge | Self::Timestamp)
    }
}

/// Trigger source for reconciliation cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleTrigger {
    Startup,
    Foreground,
    Periodic,
    Manual,
}

/// Cross-tab notification published after local state was re-synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncBroadcast {
    ResourceChanged {
        resource: String,
        etag: Option<String>,
    },
    ConflictResolved {
        entity_key: EntityKey,
        method: ResolutionMethod,
    },
}

/// Determines whether an incoming version should overwrite the local one.
///
/// Rule:
/// 1. later `updated_at` wins
/// 2. if equal, the server version wins
///
/// Returns `None` when either side has no timestamp.
pub fn server_wins_lww(
    local_updated_at: Option<DateTime<Utc>>,
    server_updated_at: Option<DateTime<Utc>>,
) -> Option<bool> {
    let (local, server) = (local_updated_at?, server_updated_at?);
    Some(server >= local)
}

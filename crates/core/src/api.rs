//! Contracts for the network collaborator and the push transport.
//!
//! The engine only talks to the server through these traits. The HTTP
//! implementation lives in `cadence-sync-client`; tests provide in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::entity::EntityKey;
use crate::errors::Result;
use crate::grouping::Filter;
use crate::sync::{
    CollectionHeader, DiffResponse, EntityManifest, EventEnvelope, PatchOutcome, PatchRequest,
    ProbeOutcome,
};

/// Parameters for a diff fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffQuery {
    pub cursor: Option<String>,
    pub last_event_id: u64,
    pub filter: Option<Filter>,
}

impl DiffQuery {
    /// Unscoped fetch of the whole collection.
    pub fn full() -> Self {
        Self::default()
    }
}

/// Network collaborator consumed by the engine.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// `GET <collection> header`
    async fn fetch_header(&self, collection: &str) -> Result<CollectionHeader>;

    /// `HEAD <collection> header` with `If-None-Match`.
    async fn probe_header(&self, collection: &str, etag: Option<&str>) -> Result<ProbeOutcome>;

    /// `GET <collection> diff`
    async fn fetch_diff(&self, collection: &str, query: &DiffQuery) -> Result<DiffResponse>;

    /// `PATCH <entity>`; a version conflict is a successful call returning
    /// [`PatchOutcome::Conflict`].
    async fn patch_entity(&self, key: &EntityKey, request: &PatchRequest) -> Result<PatchOutcome>;

    /// `GET <entity> manifest`
    async fn fetch_manifest(&self, key: &EntityKey) -> Result<EntityManifest>;
}

/// Join/subscribe message announced on every transport-level connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub namespace: String,
    pub last_event_id: u64,
}

/// Event delivered by a push transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Envelope(EventEnvelope),
    Disconnected { reason: String },
}

/// Persistent bidirectional push connection.
///
/// Implementations own reconnection: after a drop they emit
/// [`TransportEvent::Disconnected`] and later [`TransportEvent::Connected`] on the
/// same receiver.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn join(&self, request: JoinRequest) -> Result<()>;

    async fn close(&self);
}

//! Engine configuration.

use std::time::Duration;

use cadence_core::entity::EntityKind;
use cadence_core::grouping::Filter;
use cadence_core::sync::{
    ACTION_LEASE_TTL_SECS, PREFETCH_CONCURRENCY, PREFETCH_TOP_N, RECONCILE_INTERVAL_SECS,
    RECONCILE_REQUEST_TIMEOUT_SECS, USER_RESOLUTION_TIMEOUT_SECS,
};

use crate::conflict::DEFAULT_AUTO_MERGE_FIELDS;

pub const WORKSPACE_ENV: &str = "CADENCE_WORKSPACE";
pub const COLLECTION_ENV: &str = "CADENCE_COLLECTION";
pub const CACHE_PATH_ENV: &str = "CADENCE_CACHE_PATH";
pub const API_URL_ENV: &str = "CADENCE_API_URL";
pub const API_TOKEN_ENV: &str = "CADENCE_API_TOKEN";

const DEFAULT_WORKSPACE: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncEngineConfig {
    pub workspace: String,
    /// Collection painted, diffed and pushed by this engine.
    pub collection: String,
    /// Resource classes checked by the reconciliation cycle.
    pub tracked_resources: Vec<String>,
    pub filter: Filter,
    pub reconcile_interval: Duration,
    pub request_timeout: Duration,
    pub prompt_timeout: Duration,
    pub prefetch_concurrency: usize,
    pub prefetch_top_n: usize,
    pub action_lease_ttl: Duration,
    pub auto_merge_fields: Vec<String>,
    /// `None` retries retryable failures until they succeed.
    pub max_attempts: Option<u32>,
    /// Directory for the SQLite cache; memory-only when unset.
    pub cache_path: Option<String>,
    /// Used to build the HTTP api when no api is injected.
    pub api_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            workspace: DEFAULT_WORKSPACE.to_string(),
            collection: EntityKind::Session.collection().to_string(),
            tracked_resources: vec![
                EntityKind::Session.collection().to_string(),
                EntityKind::Task.collection().to_string(),
            ],
            filter: Filter::default(),
            reconcile_interval: Duration::from_secs(RECONCILE_INTERVAL_SECS),
            request_timeout: Duration::from_secs(RECONCILE_REQUEST_TIMEOUT_SECS),
            prompt_timeout: Duration::from_secs(USER_RESOLUTION_TIMEOUT_SECS),
            prefetch_concurrency: PREFETCH_CONCURRENCY,
            prefetch_top_n: PREFETCH_TOP_N,
            action_lease_ttl: Duration::from_secs(ACTION_LEASE_TTL_SECS),
            auto_merge_fields: DEFAULT_AUTO_MERGE_FIELDS
                .iter()
                .map(|field| field.to_string())
                .collect(),
            max_attempts: None,
            cache_path: None,
            api_url: None,
            api_token: None,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl SyncEngineConfig {
    /// Defaults overridden by `CADENCE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workspace) = non_empty_env(WORKSPACE_ENV) {
            config.workspace = workspace;
        }
        if let Some(collection) = non_empty_env(COLLECTION_ENV) {
            if EntityKind::from_collection(&collection).is_none() {
                log::warn!(
                    "[SyncEngine] Unknown collection '{}' in {}",
                    collection,
                    COLLECTION_ENV
                );
            }
            if !config.tracked_resources.contains(&collection) {
                config.tracked_resources.push(collection.clone());
            }
            config.collection = collection;
        }
        config.cache_path = non_empty_env(CACHE_PATH_ENV);
        config.api_url = non_empty_env(API_URL_ENV);
        config.api_token = non_empty_env(API_TOKEN_ENV);
        config
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Namespace announced on the push channel.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.workspace, self.collection)
    }
}

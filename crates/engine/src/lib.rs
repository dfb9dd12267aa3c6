//! Cadence sync engine.
//!
//! Keeps a local, always-paintable view of a workspace's meeting sessions and
//! tasks in step with the server: durable snapshot cache, ordered push events,
//! optimistic offline mutations with conflict resolution, periodic drift checks
//! and detail prefetch.

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod lease;
pub mod prefetch;
pub mod queue;
pub mod reconcile;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use broadcast::{CrossTabBroadcast, LocalBroadcastHub};
pub use channel::{ChannelState, ChannelStats, EventChannel};
pub use config::SyncEngineConfig;
pub use conflict::{
    ConflictMetrics, ConflictPrompt, ConflictResolver, PromptChoice, ResolutionOutcome,
};
pub use engine::{
    BootstrapReport, BootstrapStep, EngineMetrics, StepReport, SyncEngine, SyncEngineBuilder,
};
pub use lease::{ActionLease, ActionLock};
pub use prefetch::{PrefetchController, PrefetchReport, PrefetchStats};
pub use queue::{ConnectivityFlag, ConnectivityMonitor, DrainHalt, DrainReport, OfflineQueue};
pub use reconcile::{ReconcileReport, ReconcileStats, ReconciliationCycle, ResourceReloader};
pub use store::{StateStore, StoreEvent, Subscription};

//! Scheduler constants for the sync engine.

/// Lifetime of the full entity snapshot in the local cache.
pub const SNAPSHOT_TTL_SECS: u64 = 60 * 60 * 24;

/// Lifetime of prefetched detail manifests.
pub const MANIFEST_TTL_SECS: u64 = 60;

/// Reconciliation cadence in seconds.
pub const RECONCILE_INTERVAL_SECS: u64 = 30;

/// Upper bound for each network call made by a reconciliation tick.
pub const RECONCILE_REQUEST_TIMEOUT_SECS: u64 = 5;

/// How long a user has to answer a conflict prompt.
pub const USER_RESOLUTION_TIMEOUT_SECS: u64 = 30;

/// Maximum concurrent manifest fetches.
pub const PREFETCH_CONCURRENCY: usize = 3;

/// Number of highest-priority visible entities warmed after bootstrap.
pub const PREFETCH_TOP_N: usize = 2;

/// Default lifetime of an action lease taken by an edit in flight.
pub const ACTION_LEASE_TTL_SECS: u64 = 15;

/// Maximum jitter (milliseconds) added to delayed queue retries.
pub const QUEUE_RETRY_JITTER_MS: u64 = 500;

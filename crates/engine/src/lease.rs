//! Action lock: expiring leases taken by the edit path.
//!
//! While any unexpired lease is held the reconciliation cycle skips its tick, so a
//! background reload never lands under an edit the user is in the middle of.
//! Leases release on drop and lapse on their own after the TTL, which covers an
//! edit path that forgets to release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Duration, Utc};
use log::debug;

use cadence_core::clock::Clock;

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LeaseTable {
    next_id: u64,
    active: HashMap<u64, LeaseEntry>,
}

impl LeaseTable {
    fn prune(&mut self, now: DateTime<Utc>) {
        self.active.retain(|id, entry| {
            let live = entry.expires_at > now;
            if !live {
                debug!("[ActionLock] Lease {} ({}) expired", id, entry.holder);
            }
            live
        });
    }
}

fn lock(table: &Mutex<LeaseTable>) -> MutexGuard<'_, LeaseTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct ActionLock {
    clock: Arc<dyn Clock>,
    table: Arc<Mutex<LeaseTable>>,
}

impl ActionLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            table: Arc::new(Mutex::new(LeaseTable::default())),
        }
    }

    pub fn acquire(&self, holder: impl Into<String>, ttl: Duration) -> ActionLease {
        let holder = holder.into();
        let expires_at = self.clock.now() + ttl;
        let mut table = lock(&self.table);
        table.next_id += 1;
        let id = table.next_id;
        table.active.insert(
            id,
            LeaseEntry {
                holder: holder.clone(),
                expires_at,
            },
        );
        debug!("[ActionLock] Lease {} acquired by {}", id, holder);
        ActionLease {
            id,
            holder,
            clock: Arc::clone(&self.clock),
            table: Arc::downgrade(&self.table),
        }
    }

    /// True while at least one unexpired lease exists.
    pub fn is_held(&self) -> bool {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        table.prune(now);
        !table.active.is_empty()
    }

    pub fn holders(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        table.prune(now);
        let mut holders: Vec<String> = table.active.values().map(|e| e.holder.clone()).collect();
        holders.sort();
        holders
    }
}

/// Exclusive marker for one in-flight edit.
#[must_use = "the lease is released as soon as it is dropped"]
pub struct ActionLease {
    id: u64,
    holder: String,
    clock: Arc<dyn Clock>,
    table: Weak<Mutex<LeaseTable>>,
}

impl ActionLease {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Extend the lease; returns false if it had already expired.
    pub fn renew(&self, ttl: Duration) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let now = self.clock.now();
        let mut table = lock(&table);
        table.prune(now);
        match table.active.get_mut(&self.id) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let now = self.clock.now();
        let active = lock(&table)
            .active
            .get(&self.id)
            .is_some_and(|entry| entry.expires_at > now);
        active
    }

    pub fn release(self) {}
}

impl Drop for ActionLease {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if lock(&table).active.remove(&self.id).is_some() {
                debug!("[ActionLock] Lease {} released by {}", self.id, self.holder);
            }
        }
    }
}

impl std::fmt::Debug for ActionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionLease")
            .field("id", &self.id)
            .field("holder", &self.holder)
            .finish()
    }
}

//! Canonical in-memory entity state.
//!
//! Every entity mutation in the engine funnels through [`StateStore::apply_diff`]
//! (or [`StateStore::apply_envelope`], which adds the ordering check). Groupings
//! are derived on every change and subscribers are notified synchronously once the
//! internal lock has been released.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, trace};
use tokio::sync::broadcast;

use cadence_core::clock::Clock;
use cadence_core::entity::{EntityKey, EntityKind, EntityRecord};
use cadence_core::grouping::{compute_groups, Filter, Groups};
use cadence_core::sync::{DiffResponse, EntityChange, EventEnvelope, Snapshot, SyncCursor};

const EVENT_BUFFER_CAPACITY: usize = 256;

/// Change notification delivered to callbacks and `watch()` receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Changed {
        upserted: Vec<EntityKey>,
        deleted: Vec<EntityKey>,
        last_event_id: u64,
    },
    FilterChanged {
        filter: Filter,
    },
    Hydrated {
        entities: usize,
    },
}

pub type StoreCallback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

type SubscriberList = Mutex<Vec<(u64, StoreCallback)>>;

/// Handle returned by [`StateStore::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the callback"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberList>,
}

impl Subscription {
    /// Remove the callback. Safe to call more than once and from inside a callback.
    pub fn unsubscribe(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StoreState {
    entities: BTreeMap<EntityKey, EntityRecord>,
    cursor: SyncCursor,
    filter: Filter,
    groups: Groups,
}

pub struct StateStore {
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
    subscribers: Arc<SubscriberList>,
    next_subscriber_id: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_CAPACITY);
        Self {
            clock,
            state: Mutex::new(StoreState {
                entities: BTreeMap::new(),
                cursor: SyncCursor::default(),
                filter: Filter::default(),
                groups: Groups::default(),
            }),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: AtomicU64::new(1),
            events,
        }
    }

    fn regroup(&self, state: &mut StoreState) {
        state.groups = compute_groups(state.entities.values(), &state.filter, self.clock.now());
    }

    /// Merge/remove under the held lock; returns the change event when something changed.
    fn apply_locked(
        &self,
        state: &mut StoreState,
        upserts: Vec<EntityRecord>,
        deletes: Vec<EntityKey>,
    ) -> Option<StoreEvent> {
        if upserts.is_empty() && deletes.is_empty() {
            return None;
        }
        let mut upserted = Vec::with_capacity(upserts.len());
        for entity in upserts {
            upserted.push(entity.key.clone());
            state.entities.insert(entity.key.clone(), entity);
        }
        let mut deleted = Vec::with_capacity(deletes.len());
        for key in deletes {
            if state.entities.remove(&key).is_some() {
                deleted.push(key);
            }
        }
        self.regroup(state);
        Some(StoreEvent::Changed {
            upserted,
            deleted,
            last_event_id: state.cursor.last_event_id,
        })
    }

    fn notify(&self, event: StoreEvent) {
        // Iterate a copy so callbacks may subscribe or unsubscribe freely.
        let callbacks: Vec<StoreCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
        if self.events.send(event).is_err() {
            trace!("[StateStore] No watchers for store event");
        }
    }

    /// Merge upserts by key and remove deletes by key.
    pub fn apply_diff(&self, upserts: Vec<EntityRecord>, deletes: Vec<EntityKey>) {
        let event = {
            let mut state = lock(&self.state);
            self.apply_locked(&mut state, upserts, deletes)
        };
        if let Some(event) = event {
            self.notify(event);
        }
    }

    /// Apply a fetched diff and move the cursor forward in one step.
    pub fn apply_fetched(&self, diff: DiffResponse) {
        let event = {
            let mut state = lock(&self.state);
            state.cursor.last_event_id = state.cursor.last_event_id.max(diff.last_event_id);
            if diff.etag.is_some() {
                state.cursor.etag = diff.etag;
            }
            state.cursor.pagination_cursor = diff.cursor;
            self.apply_locked(&mut state, diff.upserts, diff.deletes)
        };
        if let Some(event) = event {
            self.notify(event);
        }
    }

    /// Apply one push envelope if it is newer than the last applied event.
    ///
    /// The ordering check and the mutation happen under the same lock, so two
    /// concurrent deliveries of one envelope apply it at most once.
    pub fn apply_envelope(&self, envelope: EventEnvelope) -> bool {
        let event = {
            let mut state = lock(&self.state);
            if envelope.event_id <= state.cursor.last_event_id {
                trace!(
                    "[StateStore] Discarding event {} (last applied {})",
                    envelope.event_id,
                    state.cursor.last_event_id
                );
                return false;
            }
            state.cursor.last_event_id = envelope.event_id;
            match envelope.change {
                EntityChange::Upsert { entity } => {
                    self.apply_locked(&mut state, vec![entity], Vec::new())
                }
                EntityChange::Delete { entity } => {
                    self.apply_locked(&mut state, Vec::new(), vec![entity])
                }
            }
        };
        if let Some(event) = event {
            self.notify(event);
        }
        true
    }

    pub fn upsert(&self, entity: EntityRecord) {
        self.apply_diff(vec![entity], Vec::new());
    }

    pub fn remove(&self, key: &EntityKey) {
        self.apply_diff(Vec::new(), vec![key.clone()]);
    }

    /// Recompute groupings for a new filter without touching entities.
    pub fn set_filter(&self, filter: Filter) {
        {
            let mut state = lock(&self.state);
            if state.filter == filter {
                return;
            }
            state.filter = filter;
            self.regroup(&mut state);
        }
        self.notify(StoreEvent::FilterChanged { filter });
    }

    /// Replace the whole state from a cached snapshot.
    pub fn hydrate(&self, snapshot: Snapshot) {
        let count = snapshot.entities.len();
        {
            let mut state = lock(&self.state);
            state.entities = snapshot
                .entities
                .into_iter()
                .map(|entity| (entity.key.clone(), entity))
                .collect();
            state.cursor = snapshot.cursor;
            if snapshot.etag.is_some() {
                state.cursor.etag = snapshot.etag;
            }
            // Cached groups may have been computed on another day.
            self.regroup(&mut state);
        }
        debug!("[StateStore] Hydrated {} entities from cache", count);
        self.notify(StoreEvent::Hydrated { entities: count });
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = lock(&self.state);
        Snapshot {
            entities: state.entities.values().cloned().collect(),
            groups: state.groups.clone(),
            cursor: state.cursor.clone(),
            etag: state.cursor.etag.clone(),
            timestamp: self.clock.now(),
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<EntityRecord> {
        lock(&self.state).entities.get(key).cloned()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        lock(&self.state).entities.contains_key(key)
    }

    pub fn entities(&self) -> Vec<EntityRecord> {
        lock(&self.state).entities.values().cloned().collect()
    }

    pub fn keys_of_kind(&self, kind: EntityKind) -> Vec<EntityKey> {
        lock(&self.state)
            .entities
            .keys()
            .filter(|key| key.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn groups(&self) -> Groups {
        lock(&self.state).groups.clone()
    }

    pub fn filter(&self) -> Filter {
        lock(&self.state).filter
    }

    pub fn cursor(&self) -> SyncCursor {
        lock(&self.state).cursor.clone()
    }

    pub fn last_event_id(&self) -> u64 {
        lock(&self.state).cursor.last_event_id
    }

    /// Highest-priority visible entities, ties broken by key.
    pub fn top_visible_by_priority(&self, limit: usize) -> Vec<EntityKey> {
        let state = lock(&self.state);
        let mut seen = HashSet::new();
        let mut visible: Vec<&EntityRecord> = state
            .groups
            .visible_keys()
            .filter(|key| seen.insert(*key))
            .filter_map(|key| state.entities.get(key))
            .collect();
        visible.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
        visible
            .into_iter()
            .take(limit)
            .map(|entity| entity.key.clone())
            .collect()
    }

    pub fn subscribe(&self, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, Arc::new(callback)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Typed broadcast of store events for cross-module consumers.
    pub fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::clock::ManualClock;
    use cadence_core::entity::EntityStatus;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-11T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn store() -> StateStore {
        StateStore::new(Arc::new(ManualClock::new(now())))
    }

    fn task(id: &str, priority: i32) -> EntityRecord {
        let mut record = EntityRecord::new(EntityKey::task(id));
        record.priority = priority;
        record.starts_at = Some(now());
        record
    }

    #[test]
    fn apply_diff_merges_and_regroups() {
        let store = store();
        store.apply_diff(vec![task("a", 1), task("b", 2)], Vec::new());
        assert_eq!(store.groups().today.len(), 2);

        let mut live = task("a", 1);
        live.status = EntityStatus::Live;
        store.apply_diff(vec![live], vec![EntityKey::task("b")]);

        let groups = store.groups();
        assert_eq!(groups.live, vec![EntityKey::task("a")]);
        assert!(groups.today.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn envelopes_at_or_below_cursor_are_discarded() {
        let store = store();
        assert!(store.apply_envelope(EventEnvelope::upsert(3, task("a", 1))));
        assert!(!store.apply_envelope(EventEnvelope::upsert(3, task("a", 9))));
        assert!(!store.apply_envelope(EventEnvelope::delete(2, EntityKey::task("a"))));
        assert_eq!(store.last_event_id(), 3);
        assert_eq!(store.get(&EntityKey::task("a")).map(|e| e.priority), Some(1));

        assert!(store.apply_envelope(EventEnvelope::delete(4, EntityKey::task("a"))));
        assert!(store.is_empty());
        assert_eq!(store.last_event_id(), 4);
    }

    #[test]
    fn fetched_diff_never_moves_cursor_backwards() {
        let store = store();
        store.apply_envelope(EventEnvelope::upsert(10, task("a", 1)));
        store.apply_fetched(DiffResponse {
            upserts: vec![task("b", 1)],
            deletes: Vec::new(),
            cursor: Some("p-1".to_string()),
            last_event_id: 4,
            etag: Some("B".to_string()),
        });
        let cursor = store.cursor();
        assert_eq!(cursor.last_event_id, 10);
        assert_eq!(cursor.etag.as_deref(), Some("B"));
        assert_eq!(cursor.pagination_cursor.as_deref(), Some("p-1"));
    }

    #[test]
    fn snapshot_is_stamped_by_injected_clock() {
        let clock = Arc::new(ManualClock::new(now()));
        let store = StateStore::new(clock.clone());
        store.upsert(task("a", 1));
        assert_eq!(store.snapshot().timestamp, now());

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(
            store.snapshot().timestamp,
            now() + chrono::Duration::minutes(5)
        );
    }

    #[test]
    fn filter_change_keeps_entities() {
        let store = store();
        let mut archived = task("a", 1);
        archived.status = EntityStatus::Archived;
        store.apply_diff(vec![archived], Vec::new());
        assert!(store.groups().is_empty());

        store.set_filter(Filter {
            show_archived: true,
            ..Filter::default()
        });
        assert_eq!(store.groups().archived, vec![EntityKey::task("a")]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_safe_during_notification() {
        let store = Arc::new(store());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let sub = {
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            store.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().expect("slot").as_ref() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().expect("slot") = Some(sub);

        store.upsert(task("a", 1));
        store.upsert(task("b", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 0);

        if let Some(sub) = slot.lock().expect("slot").take() {
            sub.unsubscribe();
            sub.unsubscribe();
        }
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn watchers_receive_typed_events() {
        let store = store();
        let mut rx = store.watch();
        store.upsert(task("a", 1));
        match rx.recv().await.expect("event") {
            StoreEvent::Changed { upserted, .. } => assert_eq!(upserted, vec![EntityKey::task("a")]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn snapshot_hydrate_round_trip() {
        let source = store();
        source.apply_envelope(EventEnvelope::upsert(5, task("a", 3)));
        let snapshot = source.snapshot();

        let target = store();
        target.hydrate(snapshot.clone());
        assert_eq!(target.entities(), snapshot.entities);
        assert_eq!(target.last_event_id(), 5);
        assert_eq!(target.groups(), snapshot.groups);
    }

    #[test]
    fn top_visible_orders_by_priority() {
        let store = store();
        store.apply_diff(vec![task("a", 1), task("b", 5), task("c", 5)], Vec::new());
        assert_eq!(
            store.top_visible_by_priority(2),
            vec![EntityKey::task("b"), EntityKey::task("c")]
        );
    }
}

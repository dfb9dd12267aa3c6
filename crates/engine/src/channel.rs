//! Push event channel.
//!
//! ```text
//! Disconnected --connect()--> Connecting --Connected--> Buffering --mark_live()--> Live
//!                                 ^                                                |
//!                                 +------------------ Disconnected ----------------+
//! ```
//!
//! While buffering (startup, or right after a reconnect) envelopes are held back
//! untouched; `mark_live` replays them in `event_id` order against the store
//! cursor. Deliveries are serialized by a separate delivery gate, so a buffering
//! decision and the matching apply never interleave with another delivery. The
//! state lock is only held for bookkeeping and is released before envelopes reach
//! the store, which leaves store subscribers free to read channel state.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cadence_core::api::{JoinRequest, PushTransport, TransportEvent};
use cadence_core::sync::EventEnvelope;
use cadence_core::Result;

use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Buffering,
    Live,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub applied: u64,
    pub discarded: u64,
    pub buffered_peak: usize,
    pub reconnects: u64,
}

struct ChannelInner {
    state: ChannelState,
    buffer: Vec<EventEnvelope>,
    live_requested: bool,
    stats: ChannelStats,
}

impl ChannelInner {
    fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            buffer: Vec::new(),
            live_requested: false,
            stats: ChannelStats::default(),
        }
    }

    fn take_buffer(&mut self) -> Vec<EventEnvelope> {
        let mut buffered = std::mem::take(&mut self.buffer);
        buffered.sort_by_key(|envelope| envelope.event_id);
        buffered
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ChannelShared {
    inner: Mutex<ChannelInner>,
    delivery: Mutex<()>,
}

impl ChannelShared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner::new()),
            delivery: Mutex::new(()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ChannelInner> {
        lock(&self.inner)
    }

    /// Apply envelopes in order with the state lock released. Callers hold the
    /// delivery gate.
    fn apply_all(&self, store: &StateStore, envelopes: Vec<EventEnvelope>) -> usize {
        let (mut applied, mut discarded) = (0u64, 0u64);
        for envelope in envelopes {
            if store.apply_envelope(envelope) {
                applied += 1;
            } else {
                discarded += 1;
            }
        }
        let mut inner = self.inner();
        inner.stats.applied += applied;
        inner.stats.discarded += discarded;
        applied as usize
    }

    fn on_envelope(&self, store: &StateStore, envelope: EventEnvelope) {
        let _delivery = lock(&self.delivery);
        let live = {
            let mut inner = self.inner();
            match inner.state {
                ChannelState::Live => Some(envelope),
                ChannelState::Buffering | ChannelState::Connecting => {
                    inner.buffer.push(envelope);
                    inner.stats.buffered_peak = inner.stats.buffered_peak.max(inner.buffer.len());
                    None
                }
                ChannelState::Disconnected => {
                    inner.stats.discarded += 1;
                    None
                }
            }
        };
        if let Some(envelope) = live {
            self.apply_all(store, vec![envelope]);
        }
    }

    /// Replay the buffer and switch to live. With `only_if_requested`, nothing
    /// happens until `mark_live` has been called at least once.
    fn go_live(&self, store: &StateStore, only_if_requested: bool) -> Option<usize> {
        let _delivery = lock(&self.delivery);
        let buffered = {
            let mut inner = self.inner();
            if !only_if_requested {
                inner.live_requested = true;
            } else if !inner.live_requested || inner.state != ChannelState::Buffering {
                return None;
            }
            inner.take_buffer()
        };
        let applied = self.apply_all(store, buffered);
        let mut inner = self.inner();
        if inner.state == ChannelState::Buffering {
            inner.state = ChannelState::Live;
        }
        Some(applied)
    }
}

pub struct EventChannel {
    namespace: String,
    transport: Arc<dyn PushTransport>,
    store: Arc<StateStore>,
    shared: Arc<ChannelShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    pub fn new(
        namespace: impl Into<String>,
        transport: Arc<dyn PushTransport>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            transport,
            store,
            shared: Arc::new(ChannelShared::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> ChannelState {
        self.shared.inner().state
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.inner().stats
    }

    pub fn buffered(&self) -> usize {
        self.shared.inner().buffer.len()
    }

    /// Open the transport in buffering mode. No-op while a pump is running.
    pub async fn connect(&self) -> Result<()> {
        {
            let pump = lock(&self.pump);
            if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Ok(());
            }
        }
        {
            let mut inner = self.shared.inner();
            inner.state = ChannelState::Connecting;
            inner.live_requested = false;
        }

        let events = match self.transport.open().await {
            Ok(events) => events,
            Err(err) => {
                self.shared.inner().state = ChannelState::Disconnected;
                return Err(err);
            }
        };
        info!("[EventChannel] Opened transport for '{}'", self.namespace);

        let handle = tokio::spawn(run_pump(
            self.namespace.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            events,
        ));
        *lock(&self.pump) = Some(handle);
        Ok(())
    }

    /// Replay buffered envelopes and switch to live delivery. Returns the number
    /// of buffered envelopes that were applied.
    pub fn mark_live(&self) -> usize {
        let applied = self.shared.go_live(&self.store, false).unwrap_or(0);
        debug!(
            "[EventChannel] Marked live (state={:?}, replayed={})",
            self.state(),
            applied
        );
        applied
    }

    /// Stop the pump and close the transport.
    pub async fn disconnect(&self) {
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.transport.close().await;
        {
            let _delivery = lock(&self.shared.delivery);
            let mut inner = self.shared.inner();
            inner.state = ChannelState::Disconnected;
            inner.live_requested = false;
            inner.buffer.clear();
        }
        info!("[EventChannel] Disconnected '{}'", self.namespace);
    }
}

async fn run_pump(
    namespace: String,
    transport: Arc<dyn PushTransport>,
    store: Arc<StateStore>,
    shared: Arc<ChannelShared>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    let mut connected_once = false;
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                {
                    let mut inner = shared.inner();
                    inner.state = ChannelState::Buffering;
                    if connected_once {
                        inner.stats.reconnects += 1;
                    }
                }
                connected_once = true;

                let request = JoinRequest {
                    namespace: namespace.clone(),
                    last_event_id: store.last_event_id(),
                };
                debug!(
                    "[EventChannel] Joining '{}' from event {}",
                    request.namespace, request.last_event_id
                );
                if let Err(err) = transport.join(request).await {
                    warn!("[EventChannel] Join failed for '{}': {}", namespace, err);
                }

                if let Some(applied) = shared.go_live(&store, true) {
                    debug!(
                        "[EventChannel] Resumed live after reconnect (replayed={})",
                        applied
                    );
                }
            }
            TransportEvent::Envelope(envelope) => {
                shared.on_envelope(&store, envelope);
            }
            TransportEvent::Disconnected { reason } => {
                info!("[EventChannel] Transport dropped: {}", reason);
                shared.inner().state = ChannelState::Connecting;
            }
        }
    }
    debug!("[EventChannel] Transport stream ended for '{}'", namespace);
    shared.inner().state = ChannelState::Disconnected;
}

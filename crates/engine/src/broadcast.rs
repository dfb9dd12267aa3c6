//! Cross-tab notification hub.
//!
//! Several engines (one per open tab or module) share a hub and hear about
//! resources another instance has re-synchronized.

use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use tokio::sync::broadcast;

use cadence_core::sync::SyncBroadcast;

pub const DEFAULT_HUB_CAPACITY: usize = 64;

pub trait CrossTabBroadcast: Send + Sync {
    fn publish(&self, message: SyncBroadcast);

    fn subscribe(&self) -> broadcast::Receiver<SyncBroadcast>;
}

/// In-process hub backed by a tokio broadcast channel.
#[derive(Debug)]
pub struct LocalBroadcastHub {
    sender: broadcast::Sender<SyncBroadcast>,
    published: AtomicU64,
}

impl Default for LocalBroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl LocalBroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl CrossTabBroadcast for LocalBroadcastHub {
    fn publish(&self, message: SyncBroadcast) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(message).is_err() {
            trace!("[BroadcastHub] No listeners");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncBroadcast> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_hears_each_message() {
        let hub = LocalBroadcastHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(SyncBroadcast::ResourceChanged {
            resource: "tasks".to_string(),
            etag: Some("B".to_string()),
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.expect("message") {
                SyncBroadcast::ResourceChanged { resource, .. } => assert_eq!(resource, "tasks"),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(hub.published(), 1);
    }

    #[test]
    fn publishing_without_listeners_is_fine() {
        let hub = LocalBroadcastHub::new(0);
        hub.publish(SyncBroadcast::ResourceChanged {
            resource: "sessions".to_string(),
            etag: None,
        });
        assert_eq!(hub.published(), 1);
    }
}

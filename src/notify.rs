use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::ClaimEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Per-pool broadcast of committed claim changes, for admin alerting.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<ClaimEvent>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one pool. Creates the channel on first use.
    pub fn subscribe(&self, pool_id: &str) -> broadcast::Receiver<ClaimEvent> {
        self.channels
            .entry(pool_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, pool_id: &str, event: ClaimEvent) {
        if let Some(sender) = self.channels.get(pool_id) {
            let _ = sender.send(event);
        }
    }
}

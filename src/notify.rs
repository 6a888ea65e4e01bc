use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, RunNo};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for occupancy changes, one channel per run.
pub struct NotifyHub {
    channels: DashMap<RunNo, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a run. Creates the channel if needed.
    pub fn subscribe(&self, run: RunNo) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(run)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, run: RunNo, event: &Event) {
        if let Some(sender) = self.channels.get(&run) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels of runs for which `keep` is false. Their receivers see
    /// the channel close.
    pub fn retain(&self, keep: impl Fn(RunNo) -> bool) {
        self.channels.retain(|run, _| keep(*run));
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

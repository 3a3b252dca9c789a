use tokio::sync::broadcast;

use crate::model::Event;

const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for committed events. Carries every page's events to the
/// post-commit dispatcher.
pub struct NotifyHub {
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let _ = self.firehose.send(event.clone());
    }
}

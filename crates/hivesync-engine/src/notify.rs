//! In-process push channel for coordination events.

use tokio::sync::broadcast;
use tracing::trace;

use hivesync_core::CoordEvent;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of [`CoordEvent`]s to any number of subscribers.
///
/// Sending never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers see `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<CoordEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: CoordEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

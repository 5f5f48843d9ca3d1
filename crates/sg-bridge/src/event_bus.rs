use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::EngineEvent;

/// Broadcast event bus built on flume channels.
///
/// Each [`subscribe`](EventBus::subscribe) call returns a receiver that sees
/// every event published after it was created. Cloning the bus is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<EngineEvent>>> {
        // A publisher that panicked mid-send leaves the list intact.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish to all current subscribers, pruning those whose receiver was
    /// dropped.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.kind(), "publishing engine event");
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

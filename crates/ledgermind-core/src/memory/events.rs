//! Notification bus for memory mutations.
//!
//! Subscribers receive notifications over bounded channels; a full or
//! disconnected channel drops the notification rather than blocking a
//! write path.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// What changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryNotification {
    /// An episodic event was appended
    EpisodicAdded {
        /// Row id
        id: i64,
        /// Event kind name
        kind: String,
    },
    /// A semantic artifact was written
    SemanticAdded {
        /// Artifact id
        id: String,
        /// Event kind name
        kind: String,
        /// Namespace it landed in
        namespace: String,
    },
}

/// Fan-out of memory notifications over bounded channels
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<SyncSender<MemoryNotification>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with the given channel capacity
    pub fn subscribe(&self, capacity: usize) -> Receiver<MemoryNotification> {
        let (tx, rx) = sync_channel(capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping on full channels and
    /// pruning disconnected ones.
    pub fn emit(&self, notification: MemoryNotification) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("notification dropped: subscriber channel full");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

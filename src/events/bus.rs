//! # Bus
//!
//! Every part of the runtime reports through one [`Bus`]: the control loop,
//! `activity::execute`, liveness reporters, executor items and the subscriber
//! drivers. The worker owns a single listener that forwards into the
//! [`SubscriberSet`](crate::SubscriberSet); tests can attach their own receivers.
//!
//! Publishing never waits. A receiver that falls more than `capacity` events
//! behind gets `RecvError::Lagged(n)` and resumes at the oldest retained event.
//! With no receiver attached, events are discarded.

use tokio::sync::broadcast;

use super::event::Event;

/// Shared handle to the runtime's broadcast channel.
#[derive(Clone, Debug)]
pub struct Bus {
    sender: broadcast::Sender<Event>,
}

impl Bus {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No receivers is not an error for a reporting channel.
        let _ = self.sender.send(event);
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of attached receivers.
    pub fn receivers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

//! # Subscribe
//!
//! Implement [`Subscribe`] to observe runs, stage attempts and item outcomes.
//! The [`SubscriberSet`](crate::SubscriberSet) gives every implementation its own
//! queue and driver task, so `on_event` may await I/O without holding up the
//! control loop. When the queue is full the event is lost for that subscriber
//! only.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use preemptvisor::{Event, EventKind, Subscribe};
//!
//! #[derive(Default)]
//! struct Deactivated(AtomicUsize);
//!
//! #[async_trait::async_trait]
//! impl Subscribe for Deactivated {
//!     async fn on_event(&self, ev: &Event) {
//!         if ev.kind == EventKind::RunCompleted {
//!             self.0.fetch_add(ev.count.unwrap_or(0) as usize, Ordering::Relaxed);
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "deactivated"
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &Event);

    /// Reported in `SubscriberOverflow` and `SubscriberPanicked` events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Events buffered before newer ones are dropped.
    fn queue_capacity(&self) -> usize {
        1024
    }
}

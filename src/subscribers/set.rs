//! # SubscriberSet: non-blocking fan-out
//!
//! ```text
//!    emit(&Event) ── Arc<Event> ──┬──► [slot "LogWriter"] ─► drive() ─► on_event()
//!                                 ├──► [slot "liveness"]  ─► drive() ─► on_event()
//!                                 └──► [slot ...]         ─► drive() ─► on_event()
//! ```
//!
//! ## Rules
//! - `emit` returns immediately; per-subscriber order is FIFO.
//! - **Overflow**: the event is dropped for that subscriber only, counted in
//!   [`SubscriberSet::dropped`], and `SubscriberOverflow` is published.
//!   Overflow events never re-publish.
//! - **Isolation**: a panic inside `on_event` is caught and reported as
//!   `SubscriberPanicked`; the subscriber keeps receiving.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};

use crate::events::{Bus, Event, EventKind};

use super::Subscribe;

struct Slot {
    name: &'static str,
    tx: mpsc::Sender<Arc<Event>>,
    dropped: AtomicU64,
}

/// Subscribers with one bounded queue and one driver task each.
pub struct SubscriberSet {
    slots: Vec<Slot>,
    drivers: JoinSet<()>,
    bus: Bus,
}

impl SubscriberSet {
    /// Starts one driver per subscriber. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut slots = Vec::with_capacity(subs.len());
        let mut drivers = JoinSet::new();

        for sub in subs {
            let (tx, rx) = mpsc::channel(sub.queue_capacity().max(1));
            slots.push(Slot {
                name: sub.name(),
                tx,
                dropped: AtomicU64::new(0),
            });
            drivers.spawn(drive(sub, rx, bus.clone()));
        }
        Self { slots, drivers, bus }
    }

    /// Queues `event` for every subscriber.
    pub fn emit(&self, event: &Event) {
        self.emit_arc(Arc::new(event.clone()));
    }

    pub fn emit_arc(&self, event: Arc<Event>) {
        let overflow = event.kind == EventKind::SubscriberOverflow;

        for slot in &self.slots {
            let why = match slot.tx.try_send(Arc::clone(&event)) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => "full",
                Err(TrySendError::Closed(_)) => "closed",
            };
            slot.dropped.fetch_add(1, Ordering::Relaxed);
            if !overflow {
                self.bus.publish(Event::subscriber_overflow(slot.name, why));
            }
        }
    }

    /// Events dropped so far for the subscriber called `name`.
    pub fn dropped(&self, name: &str) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }

    /// Closes every queue and waits until the drivers have handled what was queued.
    pub async fn shutdown(self) {
        let SubscriberSet { slots, mut drivers, .. } = self;
        drop(slots);
        while drivers.join_next().await.is_some() {}
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

async fn drive(sub: Arc<dyn Subscribe>, mut rx: mpsc::Receiver<Arc<Event>>, bus: Bus) {
    let name = sub.name();
    while let Some(ev) = rx.recv().await {
        let handled = AssertUnwindSafe(sub.on_event(&ev)).catch_unwind().await;
        if let Err(panic) = handled {
            bus.publish(Event::subscriber_panicked(name, describe_panic(panic.as_ref())));
        }
    }
}

fn describe_panic(panic: &(dyn Any + Send)) -> String {
    match (panic.downcast_ref::<&'static str>(), panic.downcast_ref::<String>()) {
        (Some(msg), _) => (*msg).to_string(),
        (None, Some(msg)) => msg.clone(),
        (None, None) => "unknown panic".to_string(),
    }
}

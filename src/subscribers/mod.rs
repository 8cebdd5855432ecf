//! # Event subscribers.
//!
//! ```text
//!   Bus ──► worker listener ──► SubscriberSet::emit(&Event)
//!                                     │
//!                         ┌───────────┼──────────────┐
//!                         ▼           ▼              ▼
//!                     LogWriter  LivenessTracker   custom
//! ```
//!
//! - [`Subscribe`] extension trait
//! - [`SubscriberSet`] bounded per-subscriber queues, panic isolation
//! - [`LivenessTracker`] in-flight stages and heartbeat counts (always installed)
//! - [`LogWriter`] `tracing` output (feature `logging`)

mod liveness;
#[cfg(feature = "logging")]
mod log;
mod set;
mod subscribe;

pub use liveness::{LivenessTracker, StageLiveness};
#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;

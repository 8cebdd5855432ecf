//! # preemptvisor
//!
//! **Preemptvisor** is a reactive preemption control loop for Rust.
//!
//! It waits for triggers ("capacity is short, free some up"), debounces them,
//! and runs a four-stage pipeline against a resource inventory: discover the
//! resources carrying a selector tag, deactivate them (gracefully or forced,
//! depending on urgency), annotate them with why, and notify a reply target.
//! Each stage runs with its own timeouts, heartbeats and retry policy; work
//! inside a stage fans out with bounded concurrency.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   TriggerHandle::signal(TriggerRequest)        QueryHandle::query("current_state")
//!            │                                              ▲
//!            ▼                                              │
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Worker (runtime host)                                            │
//! │  - Bus (broadcast events)                                         │
//! │  - LivenessTracker (in-flight stages, heartbeat counts)           │
//! │  - SubscriberSet (fans out to user subscribers)                   │
//! │  - CancellationToken (cancel endpoint, OS signals)                │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//!                      ┌────────────────────┐
//!                      │    ControlLoop     │  debounce: should_run(now, last_run, interval)
//!                      └─────────┬──────────┘
//!                                ▼
//!                      ┌────────────────────┐
//!                      │      Pipeline      │  one RunOutcome per accepted trigger
//!                      └─────────┬──────────┘
//!        ┌───────────────┬───────┴───────┬──────────────────┐
//!        ▼               ▼               ▼                  ▼
//!    discover        deactivate       annotate            notify
//!        │               │               │                  │
//!        └───────────────┴── activity::execute (retry, timeouts, heartbeats)
//!                        │               │
//!                        └── BoundedExecutor (≤ max_concurrent per stage)
//!                                        │
//!                                        ▼
//!                          ResourceClient / Notifier
//! ```
//!
//! ### Stage attempt
//! ```text
//! loop {
//!   ├─► attempt += 1
//!   ├─► publish StageStarting{ stage, run, attempt }
//!   ├─► select! (biased)
//!   │     ├─ op(ActivityContext)       ─► Ok / Err(StageError)
//!   │     ├─ start-to-close deadline   ─► StageTimeout, Err(Timeout)
//!   │     └─ heartbeat watchdog        ─► StageTimeout, Err(Timeout)
//!   │
//!   ├─ Ok  ──► publish StageCompleted, return
//!   └─ Err ──► publish StageFailed
//!              ├─ non-retryable or attempts exhausted ─► return Err
//!              └─ publish RetryScheduled{ delay }, sleep (cancellable)
//! }
//! ```
//!
//! ## Features
//! | Area              | Description                                                    | Key types / traits                          |
//! |-------------------|----------------------------------------------------------------|---------------------------------------------|
//! | **Runtime**       | Host the control loop, shutdown with grace.                    | [`Worker`], [`WorkerBuilder`]               |
//! | **Endpoints**     | Send triggers, read committed state, cancel.                   | [`TriggerHandle`], [`QueryHandle`]          |
//! | **Stages**        | Pluggable pipeline stages and the inventory-backed default.    | [`PreemptionStages`], [`ResourceActivities`]|
//! | **Clients**       | Inventory and notification transports.                         | [`ResourceClient`], [`Notifier`]            |
//! | **Policies**      | Debounce gate and stage retry policy.                          | [`should_run`], [`RetryPolicy`]             |
//! | **Subscriber API**| Hook into loop and stage events.                               | [`Subscribe`], [`Event`]                    |
//! | **Errors**        | Typed errors for stages, clients and the runtime.              | [`StageError`], [`RuntimeError`]            |
//! | **Configuration** | Centralize runtime settings (defaults or TOML).                | [`Config`]                                  |
//!
//! ## Optional features
//! - `logging`: exports the built-in [`LogWriter`] subscriber.
//! - `http`: exports [`HttpNotifier`] (CloudEvents over HTTP).
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use preemptvisor::{
//!     CauseEvent, Config, PowerState, TriggerRequest, Urgency, Worker,
//!     client::memory::{InMemoryInventory, MemoryNotifier},
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inventory = Arc::new(InMemoryInventory::new());
//!     let vm = inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOn);
//!
//!     let worker = Worker::builder(Config::default())
//!         .handle_os_signals(false)
//!         .build_with_clients(inventory.clone(), Arc::new(MemoryNotifier::new()));
//!
//!     let triggers = worker.triggers();
//!     let query = worker.query();
//!     let cancel = worker.cancel_token();
//!     let running = tokio::spawn(worker.run());
//!
//!     let event = CauseEvent::new("alarm-1", "capacity-monitor", "ThresholdExceeded");
//!     triggers.signal(TriggerRequest::new("preemptible", Urgency::High, event)).await?;
//!     query.wait_handled(1).await;
//!
//!     assert_eq!(inventory.power(&vm), Some(PowerState::PoweredOff));
//!     println!("{}", query.query("current_state")?);
//!
//!     cancel.cancel();
//!     let last = running.await??;
//!     assert_eq!(last.last_deactivated_set.len(), 1);
//!     Ok(())
//! }
//! ```
pub mod client;
mod clock;
mod core;
mod error;
mod events;
mod policies;
mod subscribers;
mod workflow;

// ---- Public re-exports ----

pub use client::{Delivery, FieldKey, Notifier, OutboundEvent, PowerState, ResourceClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use core::{
    ActivityContext, ActivityOptions, BoundedExecutor, Config, ControlLoop, DEFAULT_WORKFLOW_ID,
    ItemOutcome, LivenessReporter, Phase, QUERY_CURRENT_STATE, QueryHandle, SIGNAL_CHANNEL,
    Snapshot, TriggerHandle, WORKFLOW_NAME, Worker, WorkerBuilder, activity,
};
pub use error::{
    ClientError, ConfigError, QueryError, RuntimeError, SignalError, StageError, TimeoutKind,
};
pub use events::{Bus, Event, EventKind};
pub use policies::{RetryPolicy, should_run};
pub use subscribers::{LivenessTracker, StageLiveness, Subscribe, SubscriberSet};
pub use workflow::{
    ANNOTATION_FIELD, AnnotationRecord, CauseEvent, NotificationPayload, NotifyOutcome,
    ParseUrgencyError, Pipeline, PreemptionStages, ResourceActivities, ResourceRef, RunOutcome,
    RunState, Stage, TriggerRequest, Urgency, WorkflowInfo,
};

// Optional: CloudEvents notifier over HTTP.
// Enable with: `--features http`
#[cfg(feature = "http")]
pub use client::HttpNotifier;

// Optional: built-in `tracing` subscriber.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;

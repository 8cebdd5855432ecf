//! Runtime core: control loop, stage execution and lifecycle.
//!
//! The public entry point is [`Worker`], which hosts one [`ControlLoop`] and
//! exposes its trigger, query and cancellation endpoints.
//!
//! Internal modules:
//! - [`activity`]: runs one stage with retries, start-to-close and heartbeat timeouts;
//! - [`executor`]: bounded-concurrency fan-out over a resource list;
//! - [`heartbeat`]: periodic liveness reports while a stage runs;
//! - [`control`]: the debounced trigger loop;
//! - [`query`] / [`signal`]: read and write endpoints of the loop;
//! - [`worker`]: hosts the loop, handles shutdown and subscriber fan-out;
//! - [`shutdown`]: cross-platform shutdown signal handling.

pub mod activity;
mod builder;
mod config;
mod control;
mod executor;
mod heartbeat;
mod query;
mod shutdown;
mod signal;
mod worker;

pub use activity::{ActivityContext, ActivityOptions};
pub use builder::{DEFAULT_WORKFLOW_ID, WorkerBuilder};
pub use config::{Config, WORKFLOW_NAME};
pub use control::{ControlLoop, Phase};
pub use executor::{BoundedExecutor, ItemOutcome};
pub use heartbeat::LivenessReporter;
pub use query::{QUERY_CURRENT_STATE, QueryHandle, Snapshot};
pub use signal::{SIGNAL_CHANNEL, TriggerHandle};
pub use worker::Worker;

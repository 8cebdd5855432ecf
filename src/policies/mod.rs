//! Retry and debounce policies.
//!
//! This module groups the knobs that control **whether** a preemption run
//! starts and **how often** a failing stage is attempted.
//!
//! ## Contents
//! - [`should_run`]   debounce gate (minimum interval between runs)
//! - [`RetryPolicy`]  attempt limit and backoff between stage attempts
//!
//! ## Quick wiring
//! ```text
//! ControlLoop ── should_run(now, last_run, cfg.debounce_interval) ──► skip | run
//! Pipeline    ── ActivityOptions { retry: RetryPolicy, .. }
//!                  └─► core::activity::execute uses:
//!                       - retry.should_retry(attempt, &err) to decide continue/stop
//!                       - retry.next(n) to schedule the next attempt
//! ```
//!
//! ## Defaults
//! - debounce interval: 60s.
//! - `RetryPolicy::default()` → initial=2s, coefficient=2.0, max=10s, attempts=3.

mod debounce;
mod retry;

pub use debounce::should_run;
pub use retry::RetryPolicy;

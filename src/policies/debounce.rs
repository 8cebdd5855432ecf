//! # Debounce gate.
//!
//! Suppresses a preemption run if the previous run started less than a minimum
//! interval ago. The gate is a pure decision; the control loop owns and updates
//! the last-run timestamp.
//!
//! ```text
//! last_run = None                   → run
//! now - last_run <  min_interval    → skip
//! now - last_run >= min_interval    → run
//! ```
//!
//! A `now` earlier than `last_run` (wall clock stepped backwards) yields a negative
//! elapsed time and therefore skips.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Returns `false` iff `now - last_run < min_interval`.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use chrono::{TimeZone, Utc};
/// use preemptvisor::should_run;
///
/// let last = Utc.with_ymd_and_hms(2021, 11, 24, 20, 0, 0).unwrap();
/// let min = Duration::from_secs(60);
///
/// assert!(should_run(last, None, min));
/// assert!(!should_run(last + chrono::Duration::seconds(59), Some(last), min));
/// assert!(should_run(last + chrono::Duration::seconds(60), Some(last), min));
/// ```
pub fn should_run(
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    min_interval: Duration,
) -> bool {
    let Some(last) = last_run else {
        return true;
    };
    match chrono::Duration::from_std(min_interval) {
        Ok(min) => now.signed_duration_since(last) >= min,
        // An interval beyond chrono's range never elapses.
        Err(_) => false,
    }
}

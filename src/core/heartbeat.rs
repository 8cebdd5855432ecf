//! # Liveness reporter.
//!
//! Background task calling [`ActivityContext::heartbeat`] every `interval` while a
//! long-running stage does its work.
//!
//! ```text
//! let _reporter = LivenessReporter::start(&ctx, interval);   // before first blocking call
//! ... stage work ...
//! // dropped on every exit path → reporter task stops
//! ```
//!
//! ## Rules
//! - The first heartbeat is sent one `interval` after start.
//! - Stops when the guard is dropped or the attempt token is cancelled.
//! - `interval == 0` starts nothing.
//! - Never affects the stage outcome.

use std::time::Duration;

use tokio::{select, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use super::activity::ActivityContext;

/// Guard of a running reporter task.
#[must_use = "the reporter stops as soon as the guard is dropped"]
pub struct LivenessReporter {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LivenessReporter {
    /// Starts reporting liveness for `ctx`.
    pub fn start(ctx: &ActivityContext, interval: Duration) -> Self {
        let stop = ctx.token().child_token();
        if interval.is_zero() {
            return Self { stop, handle: None };
        }

        let ctx = ctx.clone();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => ctx.heartbeat(),
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Whether a background task was started.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the reporter and waits for its task to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LivenessReporter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

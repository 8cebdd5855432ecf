//! # Activity runner: one stage, many attempts.
//!
//! [`execute`] drives a stage operation through the [`RetryPolicy`], enforcing
//! the two per-attempt deadlines and publishing lifecycle events to the [`Bus`].
//!
//! ```text
//! loop:
//!   parent cancelled? ───────────────────────────────► Err(Canceled)
//!   attempt += 1, publish StageStarting
//!   select! (biased)
//!     ├─ op(ctx)                    → Ok  → StageCompleted → return
//!     │                             → Err → StageFailed
//!     ├─ start_to_close deadline    → cancel attempt, StageTimeout + StageFailed
//!     └─ heartbeat watchdog         → cancel attempt, StageTimeout + StageFailed
//!   should_retry(attempt, err)? no ──────────────────► Err(err)
//!   publish RetryScheduled, sleep(next(attempt-1)) or parent cancelled → Err(Canceled)
//! ```
//!
//! ## Rules
//! - Each attempt gets a **child token** of the parent; a deadline cancels only that attempt.
//! - Parent cancellation is **not** a deadline: the in-flight attempt is awaited
//!   (in-flight calls are never aborted), then no further attempt is scheduled.
//! - The heartbeat watchdog measures silence between [`ActivityContext::heartbeat`]
//!   calls and goes inert once the attempt token is cancelled.
//! - Attempts run strictly sequentially.
//! - A panicking attempt fails the stage as `NonRetryable` (`internal`).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::{select, sync::watch, time};
use tokio_util::sync::CancellationToken;

use crate::{
    core::Config,
    error::{StageError, TimeoutKind},
    events::{Bus, Event, EventKind},
    policies::RetryPolicy,
};

/// Per-stage execution contract.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivityOptions {
    /// Upper bound on one attempt (`0` = none).
    pub start_to_close_timeout: Duration,
    /// Longest tolerated heartbeat silence (`0` = none).
    pub heartbeat_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            start_to_close_timeout: cfg.start_to_close_timeout,
            heartbeat_timeout: cfg.heartbeat_timeout,
            retry: cfg.retry,
        }
    }

    /// Per-attempt deadline, `None` when `start_to_close_timeout` is zero.
    #[inline]
    pub fn attempt_deadline(&self) -> Option<Duration> {
        (!self.start_to_close_timeout.is_zero()).then_some(self.start_to_close_timeout)
    }

    /// Tolerated heartbeat silence, `None` when disabled.
    #[inline]
    pub fn heartbeat_deadline(&self) -> Option<Duration> {
        (!self.heartbeat_timeout.is_zero()).then_some(self.heartbeat_timeout)
    }
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Handle given to a stage attempt.
///
/// Cheap to clone; clones report liveness for the same attempt.
#[derive(Clone, Debug)]
pub struct ActivityContext {
    stage: &'static str,
    run: Arc<str>,
    attempt: u32,
    token: CancellationToken,
    beats: Arc<watch::Sender<u64>>,
    bus: Bus,
}

impl ActivityContext {
    /// Creates a detached context (no watchdog observes its heartbeats).
    pub fn new(
        stage: &'static str,
        run: impl Into<Arc<str>>,
        attempt: u32,
        token: CancellationToken,
        bus: Bus,
    ) -> Self {
        let (beats, _rx) = watch::channel(0);
        Self {
            stage,
            run: run.into(),
            attempt,
            token,
            beats: Arc::new(beats),
            bus,
        }
    }

    /// Records liveness for this attempt.
    pub fn heartbeat(&self) {
        self.beats.send_modify(|n| *n = n.wrapping_add(1));
        self.bus.publish(
            Event::new(EventKind::Heartbeat)
                .with_stage(self.stage)
                .with_run(Arc::clone(&self.run))
                .with_attempt(self.attempt),
        );
    }

    /// Cancelled on loop cancellation or when this attempt hits a deadline.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn run(&self) -> &Arc<str> {
        &self.run
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Number of heartbeats recorded so far.
    pub fn beats(&self) -> u64 {
        *self.beats.borrow()
    }

    pub(crate) fn subscribe_beats(&self) -> watch::Receiver<u64> {
        self.beats.subscribe()
    }
}

/// Runs `op` for `stage` until it succeeds, fails for good, or `parent` is cancelled.
pub async fn execute<T, F, Fut>(
    stage: &'static str,
    run: &Arc<str>,
    options: &ActivityOptions,
    parent: &CancellationToken,
    bus: &Bus,
    op: F,
) -> Result<T, StageError>
where
    F: Fn(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt: u32 = 0;

    loop {
        if parent.is_cancelled() {
            return Err(StageError::Canceled);
        }
        attempt = attempt.saturating_add(1);
        bus.publish(
            Event::new(EventKind::StageStarting)
                .with_stage(stage)
                .with_run(Arc::clone(run))
                .with_attempt(attempt),
        );

        let err = match run_attempt(stage, run, attempt, options, parent, bus, &op).await {
            Ok(v) => {
                bus.publish(
                    Event::new(EventKind::StageCompleted)
                        .with_stage(stage)
                        .with_run(Arc::clone(run))
                        .with_attempt(attempt),
                );
                return Ok(v);
            }
            Err(e) => e,
        };

        bus.publish(
            Event::new(EventKind::StageFailed)
                .with_stage(stage)
                .with_run(Arc::clone(run))
                .with_attempt(attempt)
                .with_reason(err.to_string()),
        );
        if parent.is_cancelled() || !options.retry.should_retry(attempt, &err) {
            return Err(err);
        }

        let delay = options.retry.next(attempt - 1);
        bus.publish(
            Event::new(EventKind::RetryScheduled)
                .with_stage(stage)
                .with_run(Arc::clone(run))
                .with_attempt(attempt)
                .with_delay(delay)
                .with_reason(err.to_string()),
        );

        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        select! {
            _ = &mut sleep => {}
            _ = parent.cancelled() => return Err(StageError::Canceled),
        }
    }
}

async fn run_attempt<T, F, Fut>(
    stage: &'static str,
    run: &Arc<str>,
    attempt: u32,
    options: &ActivityOptions,
    parent: &CancellationToken,
    bus: &Bus,
    op: &F,
) -> Result<T, StageError>
where
    F: Fn(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let token = parent.child_token();
    let ctx = ActivityContext::new(stage, Arc::clone(run), attempt, token.clone(), bus.clone());
    let mut beats = ctx.subscribe_beats();
    let fut = AssertUnwindSafe(op(ctx)).catch_unwind();
    tokio::pin!(fut);

    let (kind, timeout) = select! {
        biased;
        res = &mut fut => {
            return res.unwrap_or_else(|_| {
                Err(StageError::non_retryable("internal", "stage panicked"))
            });
        }
        _ = deadline(options.attempt_deadline()) => {
            (TimeoutKind::StartToClose, options.start_to_close_timeout)
        }
        _ = heartbeat_watchdog(&mut beats, options.heartbeat_deadline(), &token) => {
            (TimeoutKind::Heartbeat, options.heartbeat_timeout)
        }
    };

    token.cancel();
    bus.publish(
        Event::new(EventKind::StageTimeout)
            .with_stage(stage)
            .with_run(Arc::clone(run))
            .with_attempt(attempt)
            .with_timeout(timeout)
            .with_reason(kind.to_string()),
    );
    Err(StageError::Timeout { kind, timeout })
}

async fn deadline(after: Option<Duration>) {
    match after {
        Some(after) => time::sleep(after).await,
        None => std::future::pending().await,
    }
}

/// Completes when no heartbeat arrived for `timeout`.
async fn heartbeat_watchdog(
    beats: &mut watch::Receiver<u64>,
    timeout: Option<Duration>,
    token: &CancellationToken,
) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        select! {
            biased;
            _ = token.cancelled() => std::future::pending::<()>().await,
            changed = time::timeout(timeout, beats.changed()) => match changed {
                Ok(Ok(())) => continue,
                // Sender gone: nothing can beat any more.
                Ok(Err(_)) => {
                    time::sleep(timeout).await;
                    return;
                }
                Err(_elapsed) => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options(max_attempts: u32) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let run: Arc<str> = Arc::from("run");
        let res = execute(
            "discover",
            &run,
            &fast_options(3),
            &CancellationToken::new(),
            &Bus::new(64),
            move |_ctx| async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(StageError::retryable("connection reset")),
                    _ => Ok(7),
                }
            },
        )
        .await;

        assert_eq!(res, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_to_close_timeout_cancels_attempt() {
        let run: Arc<str> = Arc::from("run");
        let options = ActivityOptions {
            start_to_close_timeout: Duration::from_secs(1),
            ..fast_options(1)
        };
        let res: Result<(), _> = execute(
            "annotate",
            &run,
            &options,
            &CancellationToken::new(),
            &Bus::new(64),
            |ctx| async move {
                ctx.token().cancelled().await;
                Ok(())
            },
        )
        .await;

        assert_eq!(
            res,
            Err(StageError::Timeout {
                kind: TimeoutKind::StartToClose,
                timeout: Duration::from_secs(1),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_attempt_fails_without_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let run: Arc<str> = Arc::from("run");
        let res: Result<(), _> = execute(
            "discover",
            &run,
            &fast_options(3),
            &CancellationToken::new(),
            &Bus::new(64),
            move |_ctx| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < u32::MAX {
                    panic!("inventory returned garbage");
                }
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            res,
            Err(StageError::NonRetryable {
                kind: "internal",
                ..
            })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_timeouts_disable_deadlines() {
        let options = ActivityOptions {
            start_to_close_timeout: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            retry: RetryPolicy::default(),
        };
        assert_eq!(options.attempt_deadline(), None);
        assert_eq!(options.heartbeat_deadline(), None);

        let defaults = ActivityOptions::default();
        assert_eq!(defaults.attempt_deadline(), Some(Duration::from_secs(300)));
        assert_eq!(defaults.heartbeat_deadline(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_inert_after_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let (_tx, mut rx) = watch::channel(0u64);
        let res = time::timeout(
            Duration::from_secs(30),
            heartbeat_watchdog(&mut rx, Some(Duration::from_secs(5)), &token),
        )
        .await;
        assert!(res.is_err());
    }
}

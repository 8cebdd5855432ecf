//! # Runtime events emitted by the control loop, the activity runner and stages.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Loop events**: waiting, trigger intake, debounce decisions, termination
//! - **Stage events**: attempt lifecycle (starting, completed, failed, timeout, retry)
//! - **Item events**: per-resource outcomes inside a fan-out
//! - **Runtime events**: shutdown handling and subscriber health
//!
//! The [`Event`] struct carries the metadata relevant to its kind: stage name,
//! run id, attempt number, delays, the affected resource and a reason.
//!
//! `seq` is process-wide and strictly increasing, so subscribers can restore
//! publish order across runs and stages.
//!
//! ```rust
//! use std::time::Duration;
//! use preemptvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::RetryScheduled)
//!     .with_stage("deactivate")
//!     .with_attempt(1)
//!     .with_delay(Duration::from_secs(2))
//!     .with_reason("connection reset");
//!
//! assert_eq!(ev.kind, EventKind::RetryScheduled);
//! assert_eq!(ev.stage.as_deref(), Some("deactivate"));
//! assert_eq!(ev.delay_ms, Some(2_000));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Loop events ===
    /// Control loop entered its wait for a trigger or cancellation.
    WaitingForSignal,

    /// A trigger was received.
    ///
    /// Sets: `reason` (`tag=.. urgency=..`)
    SignalReceived,

    /// Trigger suppressed by the debounce gate.
    ///
    /// Sets: `reason` (last run / threshold)
    RunSkipped,

    /// Pipeline run started.
    ///
    /// Sets: `run`
    RunStarted,

    /// Pipeline finished its stage sequence.
    ///
    /// Sets: `run`, `count` (deactivated resources)
    RunCompleted,

    /// A fatal stage failure aborted the remaining stages of this run.
    ///
    /// Sets: `run`, `stage`, `reason`
    RunAborted,

    /// Cancellation observed; the loop is terminating.
    CancelRequested,

    /// Control loop returned.
    LoopStopped,

    // === Stage events ===
    /// Stage attempt is starting.
    ///
    /// Sets: `run`, `stage`, `attempt`
    StageStarting,

    /// Stage attempt succeeded.
    ///
    /// Sets: `run`, `stage`, `attempt`
    StageCompleted,

    /// Stage attempt failed.
    ///
    /// Sets: `run`, `stage`, `attempt`, `reason`
    StageFailed,

    /// Stage attempt hit a deadline (always followed by `StageFailed`).
    ///
    /// Sets: `run`, `stage`, `attempt`, `timeout_ms`, `reason` (deadline kind)
    StageTimeout,

    /// Next stage attempt scheduled.
    ///
    /// Sets: `run`, `stage`, `attempt` (failed attempt), `delay_ms`, `reason`
    RetryScheduled,

    /// Liveness signal from a running stage.
    ///
    /// Sets: `run`, `stage`, `attempt`
    Heartbeat,

    /// Best-effort annotation stage failed; the run continues.
    ///
    /// Sets: `run`, `reason`
    AnnotationFailed,

    /// No reply target; notification not attempted.
    ///
    /// Sets: `run`
    NotifySkipped,

    /// Notification could not be delivered.
    ///
    /// Sets: `run`, `reason`
    NotificationFailed,

    // === Item events ===
    /// A resource was left untouched (e.g. not powered on).
    ///
    /// Sets: `run`, `stage`, `resource`, `reason`
    ItemSkipped,

    /// A single resource call failed; excluded from the stage result.
    ///
    /// Sets: `run`, `stage`, `resource`, `reason`
    ItemFailed,

    // === Runtime events ===
    /// OS shutdown signal observed.
    ShutdownRequested,

    /// Control loop did not stop within the configured grace period.
    GraceExceeded,

    /// Event lost for one subscriber; its queue was full or its driver gone.
    ///
    /// Sets: `stage` (subscriber name), `reason`
    SubscriberOverflow,

    /// `on_event` panicked; the subscriber keeps running.
    ///
    /// Sets: `stage` (subscriber name), `reason`
    SubscriberPanicked,
}

/// One runtime event. Unused fields stay `None`.
#[derive(Clone, Debug)]
pub struct Event {
    pub seq: u64,
    pub at: SystemTime,
    pub kind: EventKind,

    /// Stage (or subscriber) name, if applicable.
    pub stage: Option<Arc<str>>,
    /// Pipeline run id, if applicable.
    pub run: Option<Arc<str>>,
    /// 1-based.
    pub attempt: Option<u32>,
    /// Delay before next attempt in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Attempt deadline in milliseconds (compact).
    pub timeout_ms: Option<u32>,
    /// Affected resource (`kind:id`).
    pub resource: Option<Arc<str>>,
    /// Generic counter (e.g. deactivated resources).
    pub count: Option<u32>,
    /// Human-readable reason (errors, skip details, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Stamps `kind` with the next sequence number and the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            kind,
            stage: None,
            run: None,
            attempt: None,
            delay_ms: None,
            timeout_ms: None,
            resource: None,
            count: None,
            reason: None,
        }
    }

    #[inline]
    pub fn with_stage(mut self, stage: impl Into<Arc<str>>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    #[inline]
    pub fn with_run(mut self, run: impl Into<Arc<str>>) -> Self {
        self.run = Some(run.into());
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Stored in milliseconds, saturating at `u32::MAX`.
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a deadline (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(compact_ms(d));
        self
    }

    #[inline]
    pub fn with_resource(mut self, resource: impl Into<Arc<str>>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    #[inline]
    pub fn with_count(mut self, n: usize) -> Self {
        self.count = Some(n.min(u32::MAX as usize) as u32);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, cause: &'static str) -> Self {
        Self::new(EventKind::SubscriberOverflow)
            .with_stage(subscriber)
            .with_reason(format!("queue {cause}"))
    }

    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, panic: String) -> Self {
        Self::new(EventKind::SubscriberPanicked)
            .with_stage(subscriber)
            .with_reason(panic)
    }
}

fn compact_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

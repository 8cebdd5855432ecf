//! # LogWriter: events to `tracing`
//!
//! Maps every [`Event`] to one `tracing` record under the `preemptvisor` target.
//! Installing a `tracing` subscriber (fmt, JSON, ..) is the binary's job.
//!
//! | level   | events                                                        |
//! |---------|---------------------------------------------------------------|
//! | `error` | `RunAborted`, `GraceExceeded`, `SubscriberPanicked`           |
//! | `warn`  | `StageFailed`, `StageTimeout`, `ItemFailed`, `AnnotationFailed`, `NotificationFailed`, `SubscriberOverflow` |
//! | `info`  | loop lifecycle, `SignalReceived`, `RunSkipped`, `RunStarted`, `RunCompleted` |
//! | `debug` | `StageStarting`, `StageCompleted`, `RetryScheduled`, `ItemSkipped`, `NotifySkipped` |
//! | `trace` | `Heartbeat`                                                   |

use async_trait::async_trait;
use tracing::{debug, error, info, trace, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let run = e.run.as_deref().unwrap_or("-");
        let stage = e.stage.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::WaitingForSignal => info!(target: "preemptvisor", "waiting for signal"),
            EventKind::SignalReceived => {
                info!(target: "preemptvisor", request = reason, "received signal")
            }
            EventKind::RunSkipped => {
                info!(target: "preemptvisor", details = reason, "skipping preemption run")
            }
            EventKind::RunStarted => info!(target: "preemptvisor", run, "preemption run started"),
            EventKind::RunCompleted => info!(
                target: "preemptvisor",
                run,
                deactivated = e.count.unwrap_or(0),
                "preemption run completed"
            ),
            EventKind::RunAborted => {
                error!(target: "preemptvisor", run, stage, error = reason, "preemption run aborted")
            }
            EventKind::CancelRequested => {
                info!(target: "preemptvisor", "received cancellation request, stopping")
            }
            EventKind::LoopStopped => info!(target: "preemptvisor", "control loop stopped"),
            EventKind::StageStarting => {
                debug!(target: "preemptvisor", run, stage, attempt = e.attempt, "stage starting")
            }
            EventKind::StageCompleted => {
                debug!(target: "preemptvisor", run, stage, attempt = e.attempt, "stage completed")
            }
            EventKind::StageFailed => warn!(
                target: "preemptvisor",
                run,
                stage,
                attempt = e.attempt,
                error = reason,
                "stage attempt failed"
            ),
            EventKind::StageTimeout => warn!(
                target: "preemptvisor",
                run,
                stage,
                attempt = e.attempt,
                timeout_ms = e.timeout_ms,
                kind = reason,
                "stage attempt timed out"
            ),
            EventKind::RetryScheduled => debug!(
                target: "preemptvisor",
                run,
                stage,
                after_attempt = e.attempt,
                delay_ms = e.delay_ms,
                error = reason,
                "retry scheduled"
            ),
            EventKind::Heartbeat => {
                trace!(target: "preemptvisor", run, stage, attempt = e.attempt, "heartbeat")
            }
            EventKind::ItemSkipped => debug!(
                target: "preemptvisor",
                run,
                stage,
                resource = e.resource.as_deref(),
                details = reason,
                "resource skipped"
            ),
            EventKind::ItemFailed => warn!(
                target: "preemptvisor",
                run,
                stage,
                resource = e.resource.as_deref(),
                error = reason,
                "resource call failed"
            ),
            EventKind::AnnotationFailed => warn!(
                target: "preemptvisor",
                run,
                error = reason,
                "could not annotate deactivated resources"
            ),
            EventKind::NotifySkipped => {
                debug!(target: "preemptvisor", run, "no reply target, notification skipped")
            }
            EventKind::NotificationFailed => {
                warn!(target: "preemptvisor", run, error = reason, "could not send notification")
            }
            EventKind::ShutdownRequested => {
                info!(target: "preemptvisor", "shutdown signal received")
            }
            EventKind::GraceExceeded => {
                error!(target: "preemptvisor", "control loop did not stop within grace")
            }
            EventKind::SubscriberOverflow => {
                warn!(
                    target: "preemptvisor",
                    subscriber = stage,
                    details = reason,
                    "subscriber dropped event"
                )
            }
            EventKind::SubscriberPanicked => {
                error!(
                    target: "preemptvisor",
                    subscriber = stage,
                    info = reason,
                    "subscriber panicked"
                )
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }

    fn queue_capacity(&self) -> usize {
        4096
    }
}

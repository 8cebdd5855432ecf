//! # Control loop.
//!
//! A single long-lived task that waits for triggers, debounces them and runs
//! the [`Pipeline`] at most once at a time.
//!
//! ```text
//!            ┌──────────────── Skipped ◄────┐
//!            ▼                              │ (within debounce interval)
//!   ┌────► Idle ── trigger ──► Debouncing ──┤
//!   │        │                              │ (proceed; last_run = now)
//!   │        │ cancelled                    ▼
//!   │        ▼                         Discovering ─► Deactivating ─► Annotating ─► Notifying
//!   │   Terminating                         │               │               │            │
//!   │                                       └───────────────┴───── commit RunState ◄─────┘
//!   └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - `select!` is **biased** towards cancellation: a pending cancellation wins
//!   over queued triggers.
//! - Triggers are served in FIFO order; each is debounced when the loop is next idle.
//! - The run start time is recorded before the first stage and committed with
//!   the run, whether or not the stages succeeded. Skipped triggers change nothing.
//! - Cancellation while idle leaves the committed [`RunState`] untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    events::{Bus, Event, EventKind},
    policies::should_run,
    workflow::{Pipeline, RunState, TriggerRequest, WorkflowInfo},
};

use super::query::{QueryHandle, StatePublisher};

/// Observable position of the control loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Debouncing,
    Skipped,
    Discovering,
    Deactivating,
    Annotating,
    Notifying,
    Terminating,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Debouncing => "debouncing",
            Phase::Skipped => "skipped",
            Phase::Discovering => "discovering",
            Phase::Deactivating => "deactivating",
            Phase::Annotating => "annotating",
            Phase::Notifying => "notifying",
            Phase::Terminating => "terminating",
        }
    }
}

/// The preemption control loop.
pub struct ControlLoop {
    info: WorkflowInfo,
    rx: mpsc::Receiver<TriggerRequest>,
    pipeline: Pipeline,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    publisher: StatePublisher,
    bus: Bus,
}

impl ControlLoop {
    /// Creates the loop and the query handle reading its state.
    pub fn new(
        info: WorkflowInfo,
        rx: mpsc::Receiver<TriggerRequest>,
        pipeline: Pipeline,
        clock: Arc<dyn Clock>,
        debounce: Duration,
        bus: Bus,
    ) -> (Self, QueryHandle) {
        let (publisher, query) = StatePublisher::new(RunState::initial(&info));
        let this = Self {
            info,
            rx,
            pipeline,
            clock,
            debounce,
            publisher,
            bus,
        };
        (this, query)
    }

    /// Serves triggers until `token` is cancelled or every sender is gone.
    ///
    /// Returns the last committed state.
    pub async fn run(mut self, token: CancellationToken) -> RunState {
        let mut state = RunState::initial(&self.info);
        let mut last_run: Option<DateTime<Utc>> = None;

        loop {
            self.publisher.set_phase(Phase::Idle);
            self.bus.publish(Event::new(EventKind::WaitingForSignal));

            let req = select! {
                biased;
                _ = token.cancelled() => {
                    self.bus.publish(Event::new(EventKind::CancelRequested));
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(req) => req,
                    None => break,
                },
            };
            self.bus.publish(
                Event::new(EventKind::SignalReceived).with_reason(format!(
                    "tag={} urgency={} event={}",
                    req.selector_tag, req.urgency, req.cause_event.id
                )),
            );

            self.publisher.set_phase(Phase::Debouncing);
            let now = self.clock.now();
            if !should_run(now, last_run, self.debounce) {
                let last = last_run.map(|t| t.to_rfc3339());
                self.bus.publish(Event::new(EventKind::RunSkipped).with_reason(format!(
                    "last run {} is within {:?} of {}",
                    last.unwrap_or_default(),
                    self.debounce,
                    now.to_rfc3339()
                )));
                self.publisher.set_phase(Phase::Skipped);
                self.publisher.skipped();
                continue;
            }
            last_run = Some(now);

            let publisher = &self.publisher;
            let outcome = self
                .pipeline
                .run(&req, now, &token, &|phase: Phase| publisher.set_phase(phase))
                .await;

            state = RunState {
                workflow_id: self.info.workflow_id.clone(),
                workflow_name: self.info.workflow_name.clone(),
                last_run_id: Some(outcome.run_id),
                last_run_timestamp: Some(now),
                last_deactivated_set: outcome.deactivated,
                selector_tag: req.selector_tag,
                urgency: Some(req.urgency),
                cause_event: Some(req.cause_event),
                reply_target: req.reply_target,
            };
            self.publisher.commit(state.clone());
        }

        self.publisher.set_phase(Phase::Terminating);
        self.bus.publish(Event::new(EventKind::LoopStopped));
        state
    }
}

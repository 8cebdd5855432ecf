//! # Query endpoint.
//!
//! The control loop publishes its committed [`RunState`] and its current
//! [`Phase`] through `watch` channels; a [`QueryHandle`] reads them without
//! ever waiting on the loop.
//!
//! ```text
//! ControlLoop ── commit(RunState) ──► watch<Snapshot> ──► QueryHandle::current_state()
//!            └── set_phase(Phase) ──► watch<Phase>    ──► QueryHandle::phase()
//! ```
//!
//! ## Rules
//! - Readers only ever see whole committed states.
//! - Values stay readable after the loop has returned.

use tokio::sync::watch;

use crate::error::QueryError;
use crate::workflow::RunState;

use super::control::Phase;

/// Query type answering with the committed run state.
pub const QUERY_CURRENT_STATE: &str = "current_state";

/// Committed state plus loop counters.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub state: RunState,
    /// Triggers taken off the queue (run or skipped).
    pub handled: u64,
    /// Triggers that went through the pipeline.
    pub runs: u64,
}

/// Read side of the loop state. Cheap to clone.
#[derive(Clone, Debug)]
pub struct QueryHandle {
    state: watch::Receiver<Snapshot>,
    phase: watch::Receiver<Phase>,
}

impl QueryHandle {
    /// Dispatches a named query.
    pub fn query(&self, query_type: &str) -> Result<String, QueryError> {
        match query_type {
            QUERY_CURRENT_STATE => self.current_state(),
            other => Err(QueryError::UnknownQueryType {
                name: other.to_string(),
            }),
        }
    }

    /// JSON of the last committed [`RunState`].
    pub fn current_state(&self) -> Result<String, QueryError> {
        let state = self.snapshot();
        Ok(serde_json::to_string(&state)?)
    }

    pub fn snapshot(&self) -> RunState {
        self.state.borrow().state.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn handled(&self) -> u64 {
        self.state.borrow().handled
    }

    pub fn runs(&self) -> u64 {
        self.state.borrow().runs
    }

    /// Waits until at least `n` triggers were handled. `false` if the loop ended first.
    pub async fn wait_handled(&self, n: u64) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| s.handled >= n).await.is_ok()
    }

    /// Waits until the loop reports `phase`. `false` if the loop ended first.
    pub async fn wait_for_phase(&self, phase: Phase) -> bool {
        let mut rx = self.phase.clone();
        rx.wait_for(|p| *p == phase).await.is_ok()
    }
}

/// Write side, owned by the control loop.
#[derive(Debug)]
pub(crate) struct StatePublisher {
    state: watch::Sender<Snapshot>,
    phase: watch::Sender<Phase>,
}

impl StatePublisher {
    pub(crate) fn new(initial: RunState) -> (Self, QueryHandle) {
        let (state_tx, state_rx) = watch::channel(Snapshot {
            state: initial,
            handled: 0,
            runs: 0,
        });
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        (
            Self {
                state: state_tx,
                phase: phase_tx,
            },
            QueryHandle {
                state: state_rx,
                phase: phase_rx,
            },
        )
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    /// Counts a suppressed trigger.
    pub(crate) fn skipped(&self) {
        self.state.send_modify(|s| s.handled += 1);
    }

    /// Commits the state of a finished run.
    pub(crate) fn commit(&self, state: RunState) {
        self.state.send_modify(|s| {
            s.state = state;
            s.handled += 1;
            s.runs += 1;
        });
    }
}

//! # Preemption pipeline: one run, four stages.
//!
//! ```text
//! RunStarted
//!   │
//!   ├─ Discovering  ─ discover(tag) ───────────── Err ─► RunAborted (fatal)
//!   ├─ Deactivating ─ deactivate(found, forced) ─ Err ─► RunAborted (fatal)
//!   ├─ Annotating   ─ annotate(deactivated) ───── Err ─► AnnotationFailed (run continues)
//!   ├─ Notifying    ─ notify(replyTo, payload) ── Err ─► NotificationFailed
//!   │     (no replyTo ─► NotifySkipped)
//!   ▼
//! RunCompleted { count = deactivated }
//! ```
//!
//! ## Rules
//! - Stages run strictly one after another, each through [`activity::execute`].
//! - The discovered set is truncated to `max_candidates`, discovery order kept.
//! - `Canceled` from any stage ends the run; what was deactivated so far is kept.
//! - Notification fires whenever a reply target is set, even with nothing deactivated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    core::{ActivityOptions, Phase, activity},
    error::StageError,
    events::{Bus, Event, EventKind},
};

use super::model::{AnnotationRecord, NotificationPayload, ResourceRef, TriggerRequest};
use super::stages::PreemptionStages;

/// Pipeline stage identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Discover,
    Deactivate,
    Annotate,
    Notify,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Deactivate => "deactivate",
            Stage::Annotate => "annotate",
            Stage::Notify => "notify",
        }
    }
}

/// How the notify stage ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// No reply target.
    Skipped,
    Delivered,
    Failed(StageError),
    /// The run ended before the stage was reached.
    NotReached,
}

/// Result of one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Candidates after truncation.
    pub discovered: Vec<ResourceRef>,
    pub deactivated: Vec<ResourceRef>,
    /// Stage whose failure ended the run early.
    pub aborted: Option<(Stage, StageError)>,
    /// Swallowed annotation failure.
    pub annotation_error: Option<StageError>,
    pub notification: NotifyOutcome,
}

impl RunOutcome {
    fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            discovered: Vec::new(),
            deactivated: Vec::new(),
            aborted: None,
            annotation_error: None,
            notification: NotifyOutcome::NotReached,
        }
    }
}

/// Runs the stage sequence for one trigger.
pub struct Pipeline {
    stages: Arc<dyn PreemptionStages>,
    options: ActivityOptions,
    workflow_id: String,
    max_candidates: usize,
    bus: Bus,
}

impl Pipeline {
    pub fn new(
        stages: Arc<dyn PreemptionStages>,
        options: ActivityOptions,
        workflow_id: impl Into<String>,
        max_candidates: usize,
        bus: Bus,
    ) -> Self {
        Self {
            stages,
            options,
            workflow_id: workflow_id.into(),
            max_candidates: max_candidates.max(1),
            bus,
        }
    }

    /// Executes one run for `req`. `on_phase` observes every stage transition.
    pub async fn run(
        &self,
        req: &TriggerRequest,
        started_at: DateTime<Utc>,
        token: &CancellationToken,
        on_phase: &(dyn Fn(Phase) + Send + Sync),
    ) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let run: Arc<str> = Arc::from(run_id.as_str());
        let mut out = RunOutcome::new(run_id, started_at);
        self.bus
            .publish(Event::new(EventKind::RunStarted).with_run(Arc::clone(&run)));

        on_phase(Phase::Discovering);
        let tag = req.selector_tag.as_str();
        let found = activity::execute(
            Stage::Discover.as_str(),
            &run,
            &self.options,
            token,
            &self.bus,
            |ctx| self.stages.discover(ctx, tag),
        )
        .await;
        out.discovered = match found {
            Ok(mut found) => {
                found.truncate(self.max_candidates);
                found
            }
            Err(e) => return self.abort(out, &run, Stage::Discover, e),
        };

        on_phase(Phase::Deactivating);
        let forced = req.urgency.forced();
        let candidates = out.discovered.as_slice();
        let deactivated = activity::execute(
            Stage::Deactivate.as_str(),
            &run,
            &self.options,
            token,
            &self.bus,
            |ctx| self.stages.deactivate(ctx, candidates, forced),
        )
        .await;
        out.deactivated = match deactivated {
            Ok(done) => done,
            Err(e) => return self.abort(out, &run, Stage::Deactivate, e),
        };

        on_phase(Phase::Annotating);
        let record = AnnotationRecord::for_run(req, &self.workflow_id, &out.run_id, started_at);
        let done = out.deactivated.as_slice();
        let annotated = activity::execute(
            Stage::Annotate.as_str(),
            &run,
            &self.options,
            token,
            &self.bus,
            |ctx| self.stages.annotate(ctx, done, &record),
        )
        .await;
        match annotated {
            Ok(()) => {}
            Err(StageError::Canceled) => {
                return self.abort(out, &run, Stage::Annotate, StageError::Canceled);
            }
            Err(e) => {
                self.bus.publish(
                    Event::new(EventKind::AnnotationFailed)
                        .with_run(Arc::clone(&run))
                        .with_stage(Stage::Annotate.as_str())
                        .with_reason(e.to_string()),
                );
                out.annotation_error = Some(e);
            }
        }

        let Some(target) = req.reply_target() else {
            self.bus
                .publish(Event::new(EventKind::NotifySkipped).with_run(Arc::clone(&run)));
            out.notification = NotifyOutcome::Skipped;
            return self.complete(out, &run);
        };

        on_phase(Phase::Notifying);
        let payload = NotificationPayload {
            annotation: record,
            resources: out.deactivated.clone(),
        };
        let notified = activity::execute(
            Stage::Notify.as_str(),
            &run,
            &self.options,
            token,
            &self.bus,
            |ctx| self.stages.notify(ctx, target, &payload),
        )
        .await;
        out.notification = match notified {
            Ok(()) => NotifyOutcome::Delivered,
            Err(StageError::Canceled) => {
                return self.abort(out, &run, Stage::Notify, StageError::Canceled);
            }
            Err(e) => {
                self.bus.publish(
                    Event::new(EventKind::NotificationFailed)
                        .with_run(Arc::clone(&run))
                        .with_stage(Stage::Notify.as_str())
                        .with_reason(e.to_string()),
                );
                NotifyOutcome::Failed(e)
            }
        };
        self.complete(out, &run)
    }

    fn abort(
        &self,
        mut out: RunOutcome,
        run: &Arc<str>,
        stage: Stage,
        err: StageError,
    ) -> RunOutcome {
        self.bus.publish(
            Event::new(EventKind::RunAborted)
                .with_run(Arc::clone(run))
                .with_stage(stage.as_str())
                .with_count(out.deactivated.len())
                .with_reason(err.as_message()),
        );
        out.aborted = Some((stage, err));
        out
    }

    fn complete(&self, out: RunOutcome, run: &Arc<str>) -> RunOutcome {
        self.bus.publish(
            Event::new(EventKind::RunCompleted)
                .with_run(Arc::clone(run))
                .with_count(out.deactivated.len()),
        );
        out
    }
}

//! Preemption workflow: data model, stage implementations and the per-run pipeline.
//!
//! ```text
//! TriggerRequest ──► Pipeline::run
//!                      ├─ discover(tag)                → Vec<ResourceRef>  (≤ max_candidates)
//!                      ├─ deactivate(refs, forced)     → Vec<ResourceRef>  (actually deactivated)
//!                      ├─ annotate(refs, record)       (failure logged, run continues)
//!                      └─ notify(reply_to, payload)    (only with a reply target)
//! ```

mod model;
mod pipeline;
mod stages;

pub use model::{
    AnnotationRecord, CauseEvent, NotificationPayload, ParseUrgencyError, ResourceRef, RunState,
    TriggerRequest, Urgency, WorkflowInfo,
};
pub use pipeline::{NotifyOutcome, Pipeline, RunOutcome, Stage};
pub use stages::{ANNOTATION_FIELD, PreemptionStages, ResourceActivities};

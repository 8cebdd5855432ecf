//! # Preemption stages.
//!
//! [`PreemptionStages`] is the typed seam between the pipeline and the outside
//! world: one method per stage, each called once per attempt by the activity
//! runner. [`ResourceActivities`] implements it on top of a [`ResourceClient`]
//! and a [`Notifier`].
//!
//! ```text
//! discover   ─► enumerate_tagged(tag), truncate to max_candidates
//! deactivate ─► per resource (bounded): power_state ─► active?
//!                                           ├─ no  ─► skipped
//!                                           └─ yes ─► forced ? force_power_off : graceful_shutdown
//! annotate   ─► ensure_annotation_field ─► per resource (bounded): set_annotation(json)
//! notify     ─► OutboundEvent{id: run-event, type: EVENT_TYPE} ─► Notifier::send ─► Ack?
//! ```
//!
//! Every stage that makes remote calls runs a [`LivenessReporter`] for the
//! whole attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    client::{Delivery, EVENT_TYPE, Notifier, OutboundEvent, ResourceClient},
    clock::{Clock, SystemClock},
    core::{ActivityContext, BoundedExecutor, Config, ItemOutcome, LivenessReporter},
    error::{ClientError, StageError},
};

use super::model::{AnnotationRecord, NotificationPayload, ResourceRef};

/// Name of the custom field holding the [`AnnotationRecord`].
pub const ANNOTATION_FIELD: &str = "com.vmware.workflows.vsphere.preemption";

/// The four pipeline stages.
///
/// Implementations are invoked once per attempt; returning a retryable
/// [`StageError`] asks the runner for another attempt.
#[async_trait]
pub trait PreemptionStages: Send + Sync + 'static {
    /// Candidate resources carrying `tag`, in discovery order.
    async fn discover(
        &self,
        ctx: ActivityContext,
        tag: &str,
    ) -> Result<Vec<ResourceRef>, StageError>;

    /// Deactivates the active subset of `resources`; returns what was deactivated.
    async fn deactivate(
        &self,
        ctx: ActivityContext,
        resources: &[ResourceRef],
        forced: bool,
    ) -> Result<Vec<ResourceRef>, StageError>;

    /// Writes `record` to every resource.
    async fn annotate(
        &self,
        ctx: ActivityContext,
        resources: &[ResourceRef],
        record: &AnnotationRecord,
    ) -> Result<(), StageError>;

    /// Delivers `payload` to `target`.
    async fn notify(
        &self,
        ctx: ActivityContext,
        target: &str,
        payload: &NotificationPayload,
    ) -> Result<(), StageError>;
}

/// Stages backed by a [`ResourceClient`] and a [`Notifier`].
pub struct ResourceActivities {
    resources: Arc<dyn ResourceClient>,
    notifier: Arc<dyn Notifier>,
    executor: BoundedExecutor,
    clock: Arc<dyn Clock>,
    max_candidates: usize,
    heartbeat_interval: Duration,
    event_source: String,
    annotation_field: String,
}

impl ResourceActivities {
    pub fn new(
        resources: Arc<dyn ResourceClient>,
        notifier: Arc<dyn Notifier>,
        cfg: &Config,
    ) -> Self {
        Self {
            resources,
            notifier,
            executor: BoundedExecutor::new(cfg.concurrency_limit()),
            clock: Arc::new(SystemClock),
            max_candidates: cfg.max_candidates,
            heartbeat_interval: cfg.heartbeat_interval,
            event_source: cfg.event_source.clone(),
            annotation_field: ANNOTATION_FIELD.to_string(),
        }
    }

    /// Clock used for outbound event times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl PreemptionStages for ResourceActivities {
    async fn discover(
        &self,
        ctx: ActivityContext,
        tag: &str,
    ) -> Result<Vec<ResourceRef>, StageError> {
        let _reporter = LivenessReporter::start(&ctx, self.heartbeat_interval);

        let mut found = self.resources.enumerate_tagged(tag).await?;
        let total = found.len();
        found.truncate(self.max_candidates);
        debug!(tag, total, kept = found.len(), "discovered tagged resources");
        Ok(found)
    }

    async fn deactivate(
        &self,
        ctx: ActivityContext,
        resources: &[ResourceRef],
        forced: bool,
    ) -> Result<Vec<ResourceRef>, StageError> {
        if resources.is_empty() {
            return Ok(Vec::new());
        }
        let _reporter = LivenessReporter::start(&ctx, self.heartbeat_interval);

        let done = self
            .executor
            .run(&ctx, resources.to_vec(), |r| {
                let client = Arc::clone(&self.resources);
                let r = r.clone();
                async move {
                    match client.power_state(&r).await {
                        Ok(state) if state.is_active() => {}
                        Ok(state) => {
                            return Ok(ItemOutcome::Skipped(format!("power state {state}")));
                        }
                        Err(e) => {
                            warn!(resource = %r, error = %e, "could not query power state");
                            return Ok(ItemOutcome::Skipped(format!("power state unknown: {e}")));
                        }
                    }
                    if forced {
                        client.force_power_off(&r).await?;
                    } else {
                        client.graceful_shutdown(&r).await?;
                    }
                    Ok::<_, ClientError>(ItemOutcome::Done)
                }
            })
            .await;

        debug!(
            requested = resources.len(),
            deactivated = done.len(),
            forced,
            "deactivation finished"
        );
        Ok(done)
    }

    async fn annotate(
        &self,
        ctx: ActivityContext,
        resources: &[ResourceRef],
        record: &AnnotationRecord,
    ) -> Result<(), StageError> {
        if resources.is_empty() {
            return Ok(());
        }
        let _reporter = LivenessReporter::start(&ctx, self.heartbeat_interval);

        let key = self
            .resources
            .ensure_annotation_field(&self.annotation_field)
            .await
            .map_err(|e| StageError::non_retryable("resource", format!("annotation field: {e}")))?;
        let value: Arc<str> = serde_json::to_string(record)
            .map_err(|e| StageError::non_retryable("encode", e))?
            .into();

        let written = self
            .executor
            .run(&ctx, resources.to_vec(), |r| {
                let client = Arc::clone(&self.resources);
                let value = Arc::clone(&value);
                let r = r.clone();
                async move {
                    client.set_annotation(&r, key, &value).await?;
                    Ok::<_, ClientError>(ItemOutcome::Done)
                }
            })
            .await;

        debug!(
            field = %key,
            requested = resources.len(),
            written = written.len(),
            "annotation finished"
        );
        Ok(())
    }

    async fn notify(
        &self,
        ctx: ActivityContext,
        target: &str,
        payload: &NotificationPayload,
    ) -> Result<(), StageError> {
        let _reporter = LivenessReporter::start(&ctx, self.heartbeat_interval);

        let data = serde_json::to_value(payload)
            .map_err(|e| StageError::non_retryable("encode", e))?;
        let event = OutboundEvent::json(
            payload.event_id(),
            self.event_source.as_str(),
            EVENT_TYPE,
            self.clock.now(),
            data,
        );

        match self.notifier.send(&event, target).await {
            Ok(Delivery::Ack) => {
                debug!(reply_to = target, id = %event.id, "notification acknowledged");
                Ok(())
            }
            Ok(Delivery::Nack(why)) => Err(StageError::retryable(format!(
                "notification {} not acknowledged: {why}",
                event.id
            ))),
            Err(e) => Err(StageError::retryable(e)),
        }
    }
}

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    client::{Notifier, ResourceClient},
    clock::{Clock, SystemClock},
    events::Bus,
    subscribers::{LivenessTracker, Subscribe},
    workflow::{Pipeline, PreemptionStages, ResourceActivities, WorkflowInfo},
};

use super::{
    ActivityOptions, Config, control::ControlLoop, signal, worker::Worker,
};

/// Workflow id used when none is configured.
pub const DEFAULT_WORKFLOW_ID: &str = "preempctl-run";

/// Builder for a [`Worker`].
pub struct WorkerBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    clock: Arc<dyn Clock>,
    workflow_id: Option<String>,
    handle_os_signals: bool,
}

impl WorkerBuilder {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            clock: Arc::new(SystemClock),
            workflow_id: None,
            handle_os_signals: true,
        }
    }

    /// Sets event subscribers.
    ///
    /// A [`LivenessTracker`] is always installed in addition.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Clock used for debouncing, run timestamps and outbound event times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Identity reported in the run state and annotations (default [`DEFAULT_WORKFLOW_ID`]).
    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    /// Whether `SIGINT`/`SIGTERM`/`SIGQUIT` cancel the loop (default `true`).
    pub fn handle_os_signals(mut self, enabled: bool) -> Self {
        self.handle_os_signals = enabled;
        self
    }

    /// Builds a worker running `stages`.
    pub fn build(self, stages: Arc<dyn PreemptionStages>) -> Worker {
        let cfg = self.cfg;
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let info = WorkflowInfo {
            workflow_id: self
                .workflow_id
                .unwrap_or_else(|| DEFAULT_WORKFLOW_ID.to_string()),
            workflow_name: cfg.workflow_name.clone(),
            started_at: self.clock.now(),
        };

        let (triggers, rx) = signal::channel(cfg.signal_capacity_clamped());
        let pipeline = Pipeline::new(
            stages,
            ActivityOptions::from_config(&cfg),
            info.workflow_id.as_str(),
            cfg.max_candidates,
            bus.clone(),
        );
        let (control, query) = ControlLoop::new(
            info.clone(),
            rx,
            pipeline,
            self.clock,
            cfg.debounce_interval,
            bus.clone(),
        );

        Worker {
            cfg,
            info,
            bus,
            subscribers: self.subscribers,
            liveness: Arc::new(LivenessTracker::new()),
            control,
            triggers,
            query,
            token: CancellationToken::new(),
            handle_os_signals: self.handle_os_signals,
        }
    }

    /// Builds a worker running [`ResourceActivities`] over the given clients.
    pub fn build_with_clients(
        self,
        resources: Arc<dyn ResourceClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Worker {
        let stages =
            ResourceActivities::new(resources, notifier, &self.cfg)
                .with_clock(Arc::clone(&self.clock));
        self.build(Arc::new(stages))
    }

    /// Generates a unique workflow id (`preempt-vms-<uuid>`).
    pub fn with_random_workflow_id(self) -> Self {
        let id = format!("preempt-vms-{}", Uuid::new_v4());
        self.with_workflow_id(id)
    }
}

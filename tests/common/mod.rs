#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use preemptvisor::{
    ActivityContext, AnnotationRecord, CauseEvent, Config, Event, ManualClock, NotificationPayload,
    PreemptionStages, QueryHandle, ResourceRef, RunState, RuntimeError, StageError, Subscribe,
    TriggerHandle, TriggerRequest, Urgency, Worker,
    client::memory::{InMemoryInventory, MemoryNotifier},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fixed start instant of the manual clock.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_792_051_200, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn trigger(tag: &str, urgency: Urgency) -> TriggerRequest {
    let cause = CauseEvent::new("757098cc", "capacity-monitor", "ThresholdExceeded");
    TriggerRequest::new(tag, urgency, cause)
}

/// One recorded stage invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum StageCall {
    Discover(String),
    Deactivate { resources: Vec<ResourceRef>, forced: bool },
    Annotate { resources: Vec<ResourceRef>, record: AnnotationRecord },
    Notify { target: String, payload: NotificationPayload },
}

/// Stages returning scripted results and recording every attempt.
#[derive(Default)]
pub struct ScriptedStages {
    found: Mutex<Vec<ResourceRef>>,
    calls: Mutex<Vec<StageCall>>,
    discover_failures: AtomicU32,
    deactivate_failures: AtomicU32,
    annotate_failures: AtomicU32,
    notify_failures: AtomicU32,
    discover_panics: AtomicU32,
    /// Held open during deactivate until cancelled.
    block_deactivate: Mutex<Option<CancellationToken>>,
    /// Deactivate never returns, even when cancelled.
    hang_deactivate: AtomicBool,
}

impl ScriptedStages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_found(ids: &[&str]) -> Arc<Self> {
        let this = Self::default();
        *this.found.lock().unwrap() = ids.iter().map(|id| ResourceRef::vm(*id)).collect();
        Arc::new(this)
    }

    pub fn fail_discover(&self, times: u32) {
        self.discover_failures.store(times, Ordering::SeqCst);
    }

    /// The next `times` discover attempts panic.
    pub fn panic_discover(&self, times: u32) {
        self.discover_panics.store(times, Ordering::SeqCst);
    }

    pub fn fail_deactivate(&self, times: u32) {
        self.deactivate_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_annotate(&self, times: u32) {
        self.annotate_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_notify(&self, times: u32) {
        self.notify_failures.store(times, Ordering::SeqCst);
    }

    /// Makes deactivate wait for its context to be cancelled; `release` unblocks it early.
    pub fn block_deactivate(&self) -> CancellationToken {
        let release = CancellationToken::new();
        *self.block_deactivate.lock().unwrap() = Some(release.clone());
        release
    }

    pub fn hang_deactivate(&self) {
        self.hang_deactivate.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&StageCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn discovers(&self) -> usize {
        self.count(|c| matches!(c, StageCall::Discover(_)))
    }

    pub fn deactivates(&self) -> usize {
        self.count(|c| matches!(c, StageCall::Deactivate { .. }))
    }

    pub fn annotates(&self) -> usize {
        self.count(|c| matches!(c, StageCall::Annotate { .. }))
    }

    pub fn notifies(&self) -> usize {
        self.count(|c| matches!(c, StageCall::Notify { .. }))
    }

    fn record(&self, call: StageCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn scripted_failure(counter: &AtomicU32, what: &str) -> Result<(), StageError> {
        let left = counter.load(Ordering::SeqCst);
        if left > 0 {
            counter.store(left - 1, Ordering::SeqCst);
            return Err(StageError::retryable(format!("{what} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl PreemptionStages for ScriptedStages {
    async fn discover(
        &self,
        _ctx: ActivityContext,
        tag: &str,
    ) -> Result<Vec<ResourceRef>, StageError> {
        self.record(StageCall::Discover(tag.to_string()));
        if Self::scripted_failure(&self.discover_panics, "inventory").is_err() {
            panic!("inventory returned a malformed page");
        }
        Self::scripted_failure(&self.discover_failures, "inventory")?;
        Ok(self.found.lock().unwrap().clone())
    }

    async fn deactivate(
        &self,
        ctx: ActivityContext,
        resources: &[ResourceRef],
        forced: bool,
    ) -> Result<Vec<ResourceRef>, StageError> {
        self.record(StageCall::Deactivate {
            resources: resources.to_vec(),
            forced,
        });
        Self::scripted_failure(&self.deactivate_failures, "power api")?;
        if self.hang_deactivate.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let block = self.block_deactivate.lock().unwrap().clone();
        if let Some(release) = block {
            tokio::select! {
                _ = ctx.token().cancelled() => return Err(StageError::Canceled),
                _ = release.cancelled() => {}
            }
        }
        Ok(resources.to_vec())
    }

    async fn annotate(
        &self,
        _ctx: ActivityContext,
        resources: &[ResourceRef],
        record: &AnnotationRecord,
    ) -> Result<(), StageError> {
        self.record(StageCall::Annotate {
            resources: resources.to_vec(),
            record: record.clone(),
        });
        Self::scripted_failure(&self.annotate_failures, "custom fields")
    }

    async fn notify(
        &self,
        _ctx: ActivityContext,
        target: &str,
        payload: &NotificationPayload,
    ) -> Result<(), StageError> {
        self.record(StageCall::Notify {
            target: target.to_string(),
            payload: payload.clone(),
        });
        Self::scripted_failure(&self.notify_failures, "broker")
    }
}

/// Subscriber keeping every event it sees.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscribe for Recorder {
    async fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn queue_capacity(&self) -> usize {
        8192
    }
}

/// Config with short timings, suited to paused-time tests.
pub fn test_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_secs(1),
        grace: Duration::from_secs(5),
        ..Config::default()
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub worker: Worker,
}

impl Harness {
    /// Trigger, query and cancellation endpoints of the worker.
    pub fn endpoints(&self) -> (TriggerHandle, QueryHandle, CancellationToken) {
        (self.worker.triggers(), self.worker.query(), self.worker.cancel_token())
    }
}

pub fn scripted_worker(stages: Arc<ScriptedStages>, cfg: Config) -> Harness {
    let clock = ManualClock::new(t0());
    let worker = Worker::builder(cfg)
        .with_clock(Arc::new(clock.clone()))
        .handle_os_signals(false)
        .build(stages);
    Harness { clock, worker }
}

pub fn inventory_worker(
    inventory: Arc<InMemoryInventory>,
    notifier: Arc<MemoryNotifier>,
    cfg: Config,
) -> Harness {
    let clock = ManualClock::new(t0());
    let worker = Worker::builder(cfg)
        .with_clock(Arc::new(clock.clone()))
        .handle_os_signals(false)
        .build_with_clients(inventory, notifier);
    Harness { clock, worker }
}

pub fn spawn(worker: Worker) -> JoinHandle<Result<RunState, RuntimeError>> {
    tokio::spawn(worker.run())
}

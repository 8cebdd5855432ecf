//! # Worker: hosts the control loop.
//!
//! The [`Worker`] owns the event bus, the subscriber fan-out and the
//! cancellation token of one control loop, and exposes the three endpoints
//! operators use: triggers, queries and cancellation.
//!
//! ```text
//! Worker::run()
//!   ├─ listener: Bus.subscribe() ─► SubscriberSet::emit(&Event)      (LogWriter, LivenessTracker, ..)
//!   ├─ spawn(ControlLoop::run(token))
//!   └─ select! (biased)
//!        ├─ loop returned                     → Ok(RunState)
//!        ├─ token cancelled (cancel endpoint) → wait up to grace
//!        └─ OS signal                         → ShutdownRequested, cancel, wait up to grace
//!
//! wait up to grace:
//!   ├─ loop returned → Ok(RunState)
//!   └─ timeout       → GraceExceeded (LivenessTracker::snapshot() for active stages)
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use preemptvisor::{
//!     CauseEvent, Config, TriggerRequest, Urgency, Worker,
//!     client::memory::{InMemoryInventory, MemoryNotifier},
//! };
//!
//! # async fn demo() -> Result<(), preemptvisor::RuntimeError> {
//! let worker = Worker::builder(Config::default())
//!     .build_with_clients(Arc::new(InMemoryInventory::new()), Arc::new(MemoryNotifier::new()));
//!
//! let triggers = worker.triggers();
//! let query = worker.query();
//! let cancel = worker.cancel_token();
//! let running = tokio::spawn(worker.run());
//!
//! triggers
//!     .signal(TriggerRequest::new("preemptible", Urgency::High, CauseEvent::default()))
//!     .await
//!     .ok();
//! query.wait_handled(1).await;
//! println!("{}", query.current_state().unwrap_or_default());
//!
//! cancel.cancel();
//! let _final_state = running.await.ok();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::{
    select,
    sync::broadcast::error::{RecvError, TryRecvError},
    task::{JoinError, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::RuntimeError,
    events::{Bus, Event, EventKind},
    subscribers::{LivenessTracker, Subscribe, SubscriberSet},
    workflow::{RunState, WorkflowInfo},
};

use super::{
    Config,
    builder::WorkerBuilder,
    control::ControlLoop,
    query::QueryHandle,
    shutdown,
    signal::TriggerHandle,
};

/// Hosts one control loop.
pub struct Worker {
    pub(super) cfg: Config,
    pub(super) info: WorkflowInfo,
    pub(super) bus: Bus,
    pub(super) subscribers: Vec<Arc<dyn Subscribe>>,
    pub(super) liveness: Arc<LivenessTracker>,
    pub(super) control: ControlLoop,
    pub(super) triggers: TriggerHandle,
    pub(super) query: QueryHandle,
    pub(super) token: CancellationToken,
    pub(super) handle_os_signals: bool,
}

impl Worker {
    pub fn builder(cfg: Config) -> WorkerBuilder {
        WorkerBuilder::new(cfg)
    }

    /// Trigger endpoint.
    pub fn triggers(&self) -> TriggerHandle {
        self.triggers.clone()
    }

    /// Query endpoint.
    pub fn query(&self) -> QueryHandle {
        self.query.clone()
    }

    /// Cancellation endpoint.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn liveness(&self) -> Arc<LivenessTracker> {
        Arc::clone(&self.liveness)
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Runs the control loop until it is cancelled; returns the final committed state.
    pub async fn run(self) -> Result<RunState, RuntimeError> {
        let Worker {
            cfg,
            bus,
            mut subscribers,
            liveness,
            control,
            triggers,
            token,
            handle_os_signals,
            ..
        } = self;

        subscribers.push(Arc::clone(&liveness) as Arc<dyn Subscribe>);
        let set = SubscriberSet::new(subscribers, bus.clone());
        let stop_listener = CancellationToken::new();
        let listener = subscriber_listener(&bus, set, stop_listener.clone());

        // The loop only ends through cancellation, not because callers dropped their handles.
        let _keep_open = triggers;
        let mut loop_task = tokio::spawn(control.run(token.clone()));

        let os_signal = async {
            if handle_os_signals {
                shutdown::wait_for_shutdown_signal().await
            } else {
                std::future::pending().await
            }
        };

        let res = select! {
            biased;
            joined = &mut loop_task => join_result(joined),
            _ = token.cancelled() => {
                wait_with_grace(&mut loop_task, cfg.grace, &bus, &liveness).await
            }
            sig = os_signal => {
                bus.publish(Event::new(EventKind::ShutdownRequested));
                token.cancel();
                let waited = wait_with_grace(&mut loop_task, cfg.grace, &bus, &liveness).await;
                match sig {
                    Ok(()) => waited,
                    Err(e) => Err(RuntimeError::Signal(e)),
                }
            }
        };

        stop_listener.cancel();
        if let Ok(set) = listener.await {
            set.shutdown().await;
        }
        res
    }
}

/// Forwards bus events to the subscriber set until stopped, then drains what is buffered.
fn subscriber_listener(
    bus: &Bus,
    set: SubscriberSet,
    stop: CancellationToken,
) -> JoinHandle<SubscriberSet> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            select! {
                biased;
                ev = rx.recv() => match ev {
                    Ok(ev) => set.emit(&ev),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = stop.cancelled() => {
                    loop {
                        match rx.try_recv() {
                            Ok(ev) => set.emit(&ev),
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
        set
    })
}

async fn wait_with_grace(
    task: &mut JoinHandle<RunState>,
    grace: Duration,
    bus: &Bus,
    liveness: &LivenessTracker,
) -> Result<RunState, RuntimeError> {
    match time::timeout(grace, &mut *task).await {
        Ok(joined) => join_result(joined),
        Err(_elapsed) => {
            bus.publish(Event::new(EventKind::GraceExceeded));
            let active = liveness.snapshot().await;
            task.abort();
            Err(RuntimeError::GraceExceeded { grace, active })
        }
    }
}

fn join_result(joined: Result<RunState, JoinError>) -> Result<RunState, RuntimeError> {
    joined.map_err(|e| RuntimeError::LoopPanicked {
        reason: e.to_string(),
    })
}

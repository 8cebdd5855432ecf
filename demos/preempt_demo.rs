//! # Example: preempt_demo
//!
//! Runs the preemption control loop against an in-memory inventory and
//! sends it two triggers: a LOW one that shuts resources down gracefully,
//! and a HIGH one that arrives inside the debounce interval and is skipped.
//! After a short pause (with a 2s debounce interval) a final HIGH trigger
//! forces the remaining resources off and notifies a reply target.
//!
//! ## Flow
//! ```text
//! main()
//!   ├─► Worker::builder(cfg).with_subscribers([LogWriter]).build_with_clients(..)
//!   ├─► spawn(worker.run())
//!   ├─► signal(LOW,  tag=preemptible)          → graceful shutdown of vm-1, vm-2
//!   ├─► signal(HIGH, tag=preemptible)          → RunSkipped (debounce)
//!   ├─► sleep(debounce)
//!   ├─► signal(HIGH, tag=batch, replyTo=..)    → forced power-off of vm-4, notify
//!   ├─► query("current_state")                 → JSON
//!   └─► cancel
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example preempt_demo
//! RUST_LOG=preemptvisor=debug PREEMPTVISOR_LOG_FORMAT=json cargo run --example preempt_demo
//! cargo run --example preempt_demo -- demos/preemptvisor.toml
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use preemptvisor::{
    CauseEvent, Config, LogWriter, PowerState, QUERY_CURRENT_STATE, Subscribe, TriggerRequest,
    Urgency, Worker,
    client::memory::{InMemoryInventory, MemoryNotifier},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // 1. Configuration: a TOML file if given, otherwise defaults with a short debounce.
    let cfg = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {path}"))?,
        None => Config {
            debounce_interval: Duration::from_secs(2),
            ..Config::default()
        },
    };
    let debounce = cfg.debounce_interval;

    // 2. In-memory inventory with a little latency per call.
    let inventory = Arc::new(InMemoryInventory::new().with_latency(Duration::from_millis(50)));
    inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOn);
    inventory.add_vm("vm-2", &["preemptible"], PowerState::PoweredOn);
    inventory.add_vm("vm-3", &["preemptible"], PowerState::PoweredOff);
    inventory.add_vm("vm-4", &["batch"], PowerState::PoweredOn);
    let notifier = Arc::new(MemoryNotifier::new());

    // 3. Worker with the built-in log subscriber.
    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::default())];
    let worker = Worker::builder(cfg)
        .with_subscribers(subs)
        .with_random_workflow_id()
        .build_with_clients(inventory.clone(), notifier.clone());

    let triggers = worker.triggers();
    let query = worker.query();
    let cancel = worker.cancel_token();
    let running = tokio::spawn(worker.run());

    // 4. Triggers.
    let alarm = CauseEvent::new("alarm-1", "capacity-monitor", "ThresholdExceeded")
        .with_data(serde_json::json!({ "threshold": 70, "current": 87 }));
    triggers
        .signal(TriggerRequest::new("preemptible", Urgency::Low, alarm.clone()))
        .await?;
    triggers
        .signal(TriggerRequest::new("preemptible", Urgency::High, alarm))
        .await?;
    query.wait_handled(2).await;

    tokio::time::sleep(debounce).await;
    let alarm = CauseEvent::new("alarm-2", "capacity-monitor", "ThresholdExceeded");
    triggers
        .signal(
            TriggerRequest::new("batch", Urgency::High, alarm)
                .with_reply_target("http://broker.local/events"),
        )
        .await?;
    query.wait_handled(3).await;

    // 5. Inspect the committed state and what was sent.
    println!("{}", query.query(QUERY_CURRENT_STATE)?);
    for (target, event) in notifier.sent() {
        println!("notified {target}: {}", serde_json::to_string(&event)?);
    }

    cancel.cancel();
    let last = running.await??;
    println!(
        "stopped after {} run(s); last run deactivated {} resource(s)",
        query.runs(),
        last.last_deactivated_set.len()
    );
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("preemptvisor=info"));
    let json = std::env::var("PREEMPTVISOR_LOG_FORMAT").is_ok_and(|v| v == "json");

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use preemptvisor::{
    EventKind, Phase, PowerState, QUERY_CURRENT_STATE, QueryError, ResourceRef, RuntimeError,
    SignalError, Subscribe, Urgency,
    client::memory::{Call, InMemoryInventory, MemoryNotifier},
};

use common::{
    Recorder, ScriptedStages, StageCall, inventory_worker, scripted_worker, spawn, t0, test_config,
    trigger,
};

#[tokio::test(start_paused = true)]
async fn test_trigger_within_debounce_interval_is_skipped() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(1).await);
    let first = query.snapshot();

    h.clock.advance(Duration::from_secs(30));
    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(2).await);

    assert_eq!(query.runs(), 1);
    assert_eq!(stages.discovers(), 1);
    assert_eq!(query.snapshot(), first, "a skipped trigger must not change the state");

    h.clock.advance(Duration::from_secs(31));
    triggers.signal(trigger("preemptible", Urgency::Low)).await.unwrap();
    assert!(query.wait_handled(3).await);

    assert_eq!(query.runs(), 2);
    let state = query.snapshot();
    assert_eq!(state.urgency, Some(Urgency::Low));
    assert_eq!(
        state.last_run_timestamp,
        Some(t0() + chrono::Duration::seconds(61))
    );

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_idle_keeps_initial_state() {
    let stages = ScriptedStages::new();
    let h = scripted_worker(stages.clone(), test_config());
    let (query, cancel) = (h.worker.query(), h.worker.cancel_token());
    let running = spawn(h.worker);

    assert!(query.wait_for_phase(Phase::Idle).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(last.last_run_timestamp, None);
    assert_eq!(last.last_run_id, None);
    assert!(last.last_deactivated_set.is_empty());
    assert!(stages.calls().is_empty());
    assert_eq!(query.phase(), Phase::Terminating);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_discovered_makes_no_resource_calls() {
    let inventory = Arc::new(InMemoryInventory::new());
    inventory.add_vm("vm-1", &["production"], PowerState::PoweredOn);
    let notifier = Arc::new(MemoryNotifier::new());
    let h = inventory_worker(inventory.clone(), notifier.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(inventory.resource_calls(), 0);
    assert_eq!(inventory.count(|c| matches!(c, Call::CreateField(_))), 0);
    assert_eq!(last.last_run_timestamp, Some(t0()));
    assert!(last.last_deactivated_set.is_empty());
    assert!(notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_high_urgency_with_inactive_resources_notifies_empty_set() {
    let inventory = Arc::new(InMemoryInventory::new());
    let a = inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOff);
    let b = inventory.add_vm("vm-2", &["preemptible"], PowerState::Suspended);
    let notifier = Arc::new(MemoryNotifier::new());
    let h = inventory_worker(inventory.clone(), notifier.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::High).with_reply_target("http://broker.local/events");
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(inventory.count(|c| matches!(c, Call::ForcePowerOff(_))), 0);
    assert_eq!(inventory.count(|c| matches!(c, Call::SetAnnotation(_))), 0);
    assert_eq!(inventory.power(&a), Some(PowerState::PoweredOff));
    assert_eq!(inventory.power(&b), Some(PowerState::Suspended));
    assert!(last.last_deactivated_set.is_empty());

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    let (target, event) = &sent[0];
    assert_eq!(target, "http://broker.local/events");
    assert_eq!(event.data["virtualMachines"], serde_json::json!([]));
    assert_eq!(event.data["forcedShutdown"], serde_json::json!(true));
}

#[tokio::test(start_paused = true)]
async fn test_high_urgency_forces_power_off_and_annotates() {
    let inventory = Arc::new(InMemoryInventory::new());
    let on = inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOn);
    let off = inventory.add_vm("vm-2", &["preemptible"], PowerState::PoweredOff);
    let notifier = Arc::new(MemoryNotifier::new());
    let h = inventory_worker(inventory.clone(), notifier.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::High).with_reply_target("http://broker.local/events");
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(last.last_deactivated_set, vec![on.clone()]);
    assert_eq!(inventory.power(&on), Some(PowerState::PoweredOff));
    assert_eq!(inventory.count(|c| c == &Call::ForcePowerOff(on.clone())), 1);
    assert_eq!(inventory.count(|c| c == &Call::ForcePowerOff(off.clone())), 0);
    assert_eq!(inventory.count(|c| matches!(c, Call::GracefulShutdown(_))), 0);

    let raw = inventory
        .annotation(&on, preemptvisor::ANNOTATION_FIELD)
        .expect("annotation written");
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["preempted"], serde_json::json!(true));
    assert_eq!(record["forcedShutdown"], serde_json::json!(true));
    assert_eq!(record["criticality"], serde_json::json!("HIGH"));
    assert_eq!(record["runID"].as_str(), last.last_run_id.as_deref());
    assert_eq!(inventory.annotation(&off, preemptvisor::ANNOTATION_FIELD), None);

    let (_, event) = &notifier.sent()[0];
    let run_id = last.last_run_id.clone().unwrap();
    assert_eq!(event.id, format!("{run_id}-757098cc"));
    assert_eq!(event.ty, preemptvisor::client::EVENT_TYPE);
    assert_eq!(event.time, t0());
}

#[tokio::test(start_paused = true)]
async fn test_low_urgency_shuts_down_gracefully() {
    let inventory = Arc::new(InMemoryInventory::new());
    let a = inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOn);
    let b = inventory.add_vm("vm-2", &["preemptible"], PowerState::PoweredOn);
    let notifier = Arc::new(MemoryNotifier::new());
    let h = inventory_worker(inventory.clone(), notifier.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::Low)).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    let mut deactivated = last.last_deactivated_set.clone();
    deactivated.sort();
    assert_eq!(deactivated, vec![a.clone(), b.clone()]);
    assert_eq!(inventory.count(|c| matches!(c, Call::GracefulShutdown(_))), 2);
    assert_eq!(inventory.count(|c| matches!(c, Call::ForcePowerOff(_))), 0);

    let raw = inventory.annotation(&a, preemptvisor::ANNOTATION_FIELD).unwrap();
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["forcedShutdown"], serde_json::json!(false));
    assert!(notifier.sent().is_empty(), "no reply target, no notification");
}

#[tokio::test(start_paused = true)]
async fn test_discovery_is_truncated_to_max_candidates() {
    let inventory = Arc::new(InMemoryInventory::new());
    for i in 0..12 {
        inventory.add_vm(&format!("vm-{i:02}"), &["preemptible"], PowerState::PoweredOn);
    }
    let h = inventory_worker(inventory.clone(), Arc::new(MemoryNotifier::new()), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::Medium)).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(last.last_deactivated_set.len(), 10);
    assert_eq!(inventory.count(|c| matches!(c, Call::ForcePowerOff(_))), 10);
    assert_eq!(inventory.power(&ResourceRef::vm("vm-10")), Some(PowerState::PoweredOn));
    assert_eq!(inventory.power(&ResourceRef::vm("vm-11")), Some(PowerState::PoweredOn));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_calls_never_exceed_concurrency_limit() {
    let inventory = Arc::new(InMemoryInventory::new().with_latency(Duration::from_millis(150)));
    for i in 0..10 {
        inventory.add_vm(&format!("vm-{i}"), &["preemptible"], PowerState::PoweredOn);
    }
    let mut cfg = test_config();
    cfg.max_concurrent = 3;
    let h = inventory_worker(inventory.clone(), Arc::new(MemoryNotifier::new()), cfg);
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(last.last_deactivated_set.len(), 10);
    assert!(inventory.peak_in_flight() <= 3, "peak {}", inventory.peak_in_flight());
    assert!(inventory.peak_in_flight() > 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_is_left_out_of_deactivated_set() {
    let inventory = Arc::new(InMemoryInventory::new());
    let ok = inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOn);
    let bad = inventory.add_vm("vm-2", &["preemptible"], PowerState::PoweredOn);
    let unknown = inventory.add_vm("vm-3", &["preemptible"], PowerState::PoweredOn);
    inventory.fail_power_off(&bad);
    inventory.fail_power_state(&unknown);
    let h = inventory_worker(inventory.clone(), Arc::new(MemoryNotifier::new()), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(last.last_deactivated_set, vec![ok.clone()]);
    assert_eq!(inventory.count(|c| c == &Call::ForcePowerOff(unknown.clone())), 0);
    assert!(inventory.annotation(&ok, preemptvisor::ANNOTATION_FIELD).is_some());
    assert!(inventory.annotation(&bad, preemptvisor::ANNOTATION_FIELD).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_annotation_failure_still_notifies() {
    let stages = ScriptedStages::with_found(&["vm-1", "vm-2"]);
    stages.fail_annotate(u32::MAX);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::High).with_reply_target("http://broker.local/events");
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(stages.annotates(), 3);
    assert_eq!(stages.notifies(), 1);
    assert_eq!(last.last_deactivated_set.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_reply_target_skips_notification() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers
        .signal(trigger("preemptible", Urgency::High).with_reply_target(""))
        .await
        .unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    running.await.unwrap().unwrap();

    assert_eq!(stages.annotates(), 1);
    assert_eq!(stages.notifies(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_exhausting_retries_aborts_run() {
    let stages = ScriptedStages::with_found(&["vm-1", "vm-2"]);
    stages.fail_deactivate(u32::MAX);
    let recorder = Recorder::new();
    let h = scripted_world_with_recorder(stages.clone(), recorder.clone());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::High).with_reply_target("http://broker.local/events");
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(stages.deactivates(), 3);
    assert_eq!(stages.annotates(), 0);
    assert_eq!(stages.notifies(), 0);
    assert_eq!(last.last_run_timestamp, Some(t0()));
    assert!(last.last_deactivated_set.is_empty());

    let events = recorder.events();
    let retries: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::RetryScheduled)
        .map(|e| e.delay_ms)
        .collect();
    assert_eq!(retries, vec![Some(2_000), Some(4_000)]);
    let aborted = events
        .iter()
        .find(|e| e.kind == EventKind::RunAborted)
        .expect("run aborted");
    assert_eq!(aborted.stage.as_deref(), Some("deactivate"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_stage_commits_partial_run() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    let _release = stages.block_deactivate();
    let mut cfg = test_config();
    cfg.heartbeat_timeout = Duration::ZERO;
    let h = scripted_worker(stages.clone(), cfg);
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_for_phase(Phase::Deactivating).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(stages.deactivates(), 1);
    assert_eq!(stages.annotates(), 0);
    assert_eq!(last.last_run_timestamp, Some(t0()));
    assert!(last.last_deactivated_set.is_empty());
    assert_eq!(query.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stage_ignoring_cancellation_exceeds_grace() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    stages.hang_deactivate();
    let mut cfg = test_config();
    cfg.heartbeat_timeout = Duration::ZERO;
    cfg.grace = Duration::from_secs(5);
    let h = scripted_worker(stages.clone(), cfg);
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_for_phase(Phase::Deactivating).await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let err = running.await.unwrap().unwrap_err();
    match err {
        RuntimeError::GraceExceeded { grace, active } => {
            assert_eq!(grace, Duration::from_secs(5));
            assert_eq!(active, vec!["deactivate".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(query.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_annotation_record_carries_run_identity() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let workflow_id = h.worker.info().workflow_id.clone();
    let running = spawn(h.worker);

    let req =
        trigger("preemptible", Urgency::Medium).with_reply_target("http://broker.local/events");
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    let calls = stages.calls();
    let Some(StageCall::Annotate { record, .. }) =
        calls.iter().find(|c| matches!(c, StageCall::Annotate { .. }))
    else {
        panic!("annotate not called");
    };
    assert_eq!(record.workflow_id, workflow_id);
    assert_eq!(Some(&record.run_id), last.last_run_id.as_ref());
    assert_eq!(record.run_started_at, t0());
    assert!(record.forced_shutdown);

    let Some(StageCall::Notify { payload, .. }) =
        calls.iter().find(|c| matches!(c, StageCall::Notify { .. }))
    else {
        panic!("notify not called");
    };
    assert_eq!(&payload.annotation, record);
    assert_eq!(payload.resources, vec![ResourceRef::vm("vm-1")]);
}

#[tokio::test(start_paused = true)]
async fn test_query_returns_committed_state_json() {
    let stages = ScriptedStages::with_found(&["vm-7"]);
    let h = scripted_worker(stages, test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(1).await);

    let raw = query.query(QUERY_CURRENT_STATE).unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(v["workflowID"], "preempctl-run");
    assert_eq!(v["workflowName"], "PreemptVMsWorkflow");
    assert_eq!(v["tag"], "preemptible");
    assert_eq!(v["criticality"], "HIGH");
    assert_eq!(v["virtualMachines"][0]["value"], "vm-7");
    assert_eq!(v["event"]["id"], "757098cc");

    let err = query.query("history").unwrap_err();
    assert!(matches!(err, QueryError::UnknownQueryType { ref name } if name == "history"));

    cancel.cancel();
    running.await.unwrap().unwrap();
    assert!(query.query(QUERY_CURRENT_STATE).is_ok(), "state stays readable after the loop ends");
}

#[tokio::test(start_paused = true)]
async fn test_trigger_after_shutdown_is_rejected() {
    let h = scripted_worker(ScriptedStages::new(), test_config());
    let (triggers, cancel) = (h.worker.triggers(), h.worker.cancel_token());
    let running = spawn(h.worker);

    cancel.cancel();
    running.await.unwrap().unwrap();

    let err = triggers.signal(trigger("preemptible", Urgency::Low)).await.unwrap_err();
    assert_eq!(err, SignalError::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_run_events_are_published_in_order() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    let recorder = Recorder::new();
    let h = scripted_world_with_recorder(stages, recorder.clone());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::High).with_reply_target("http://broker.local/events");
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    running.await.unwrap().unwrap();

    let kinds: Vec<EventKind> = recorder.events().iter().map(|e| e.kind).collect();
    let pos = |k: EventKind| kinds.iter().position(|x| *x == k).unwrap_or(usize::MAX);
    assert!(pos(EventKind::SignalReceived) < pos(EventKind::RunStarted));
    assert!(pos(EventKind::RunStarted) < pos(EventKind::StageStarting));
    assert!(pos(EventKind::StageCompleted) < pos(EventKind::RunCompleted));
    assert!(pos(EventKind::RunCompleted) < pos(EventKind::CancelRequested));
    assert_eq!(kinds.last(), Some(&EventKind::LoopStopped));
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::StageCompleted).count(), 4);
}

fn scripted_world_with_recorder(
    stages: Arc<ScriptedStages>,
    recorder: Arc<Recorder>,
) -> common::Harness {
    let clock = preemptvisor::ManualClock::new(t0());
    let worker = preemptvisor::Worker::builder(test_config())
        .with_clock(Arc::new(clock.clone()))
        .with_subscribers(vec![recorder as Arc<dyn Subscribe>])
        .handle_os_signals(false)
        .build(stages);
    common::Harness { clock, worker }
}

#[tokio::test(start_paused = true)]
async fn test_failed_discovery_aborts_run_and_still_debounces() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    stages.fail_discover(3);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::High).with_reply_target("http://broker.local/events");
    triggers.signal(req.clone()).await.unwrap();
    assert!(query.wait_handled(1).await);

    assert_eq!(stages.discovers(), 3);
    assert_eq!(stages.deactivates(), 0);
    assert_eq!(stages.annotates(), 0);
    assert_eq!(stages.notifies(), 0);
    assert_eq!(query.runs(), 1);
    let state = query.snapshot();
    assert_eq!(state.last_run_timestamp, Some(t0()));
    assert!(state.last_deactivated_set.is_empty());

    h.clock.advance(Duration::from_secs(10));
    triggers.signal(req.clone()).await.unwrap();
    assert!(query.wait_handled(2).await);
    assert_eq!(stages.discovers(), 3);
    assert_eq!(query.runs(), 1);

    h.clock.advance(Duration::from_secs(51));
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(3).await);
    assert_eq!(query.runs(), 2);
    assert_eq!(stages.discovers(), 4);
    assert_eq!(stages.deactivates(), 1);
    assert_eq!(stages.notifies(), 1);
    assert_eq!(query.snapshot().last_deactivated_set, vec![ResourceRef::vm("vm-1")]);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_enumeration_failures_are_retried() {
    let inventory = Arc::new(InMemoryInventory::new());
    let vm = inventory.add_vm("vm-1", &["preemptible"], PowerState::PoweredOn);
    inventory.fail_enumerate(2);
    let notifier = Arc::new(MemoryNotifier::new());
    let h = inventory_worker(inventory.clone(), notifier, test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::Medium)).await.unwrap();
    assert!(query.wait_handled(1).await);
    cancel.cancel();
    let last = running.await.unwrap().unwrap();

    assert_eq!(inventory.count(|c| matches!(c, Call::Enumerate(_))), 3);
    assert_eq!(last.last_deactivated_set, vec![vm.clone()]);
    assert_eq!(inventory.power(&vm), Some(PowerState::PoweredOff));
}

#[tokio::test(start_paused = true)]
async fn test_undeliverable_notification_still_commits_run() {
    let stages = ScriptedStages::with_found(&["vm-1", "vm-2"]);
    stages.fail_notify(3);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    let req = trigger("preemptible", Urgency::Low).with_reply_target("http://broker.local/events");
    triggers.signal(req.clone()).await.unwrap();
    assert!(query.wait_handled(1).await);

    assert_eq!(stages.notifies(), 3);
    assert_eq!(query.runs(), 1);
    let state = query.snapshot();
    assert_eq!(state.last_run_timestamp, Some(t0()));
    assert_eq!(
        state.last_deactivated_set,
        vec![ResourceRef::vm("vm-1"), ResourceRef::vm("vm-2")]
    );

    h.clock.advance(Duration::from_secs(61));
    triggers.signal(req).await.unwrap();
    assert!(query.wait_handled(2).await);
    assert_eq!(query.runs(), 2);
    assert_eq!(stages.discovers(), 2);
    assert_eq!(stages.notifies(), 4);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_stage_does_not_stop_the_loop() {
    let stages = ScriptedStages::with_found(&["vm-1"]);
    stages.panic_discover(1);
    let h = scripted_worker(stages.clone(), test_config());
    let (triggers, query, cancel) = h.endpoints();
    let running = spawn(h.worker);

    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(1).await);
    assert_eq!(stages.discovers(), 1, "a panic is not retried");
    assert_eq!(stages.deactivates(), 0);
    assert_eq!(query.snapshot().last_run_timestamp, Some(t0()));

    h.clock.advance(Duration::from_secs(61));
    triggers.signal(trigger("preemptible", Urgency::High)).await.unwrap();
    assert!(query.wait_handled(2).await);
    assert_eq!(query.runs(), 2);
    assert_eq!(stages.deactivates(), 1);

    cancel.cancel();
    let last = running.await.unwrap().unwrap();
    assert_eq!(last.last_deactivated_set, vec![ResourceRef::vm("vm-1")]);
}

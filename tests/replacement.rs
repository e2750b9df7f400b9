//! Scenario tests for the rolling-replacement controller, driven end to end
//! against the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use conifer_deploy::test_support::{
    instance, FakeInstanceTracker, FakeLaunchQueue, ManualReadinessExecutor, RecordingKillService,
};
use conifer_deploy::{
    AppId, Condition, DeploymentStatus, Goal, HealthCheck, InstanceChanged, InstanceEvent,
    InstanceEventBus, InstanceHealthChanged, InstanceId, KillReason, ReadinessCheck,
    ReadinessCheckSpec, ReadinessCheckUpdate, ReplacementController, RunSpec, RunSpecVersion,
    UpgradeStrategy,
};

const DEADLINE: Duration = Duration::from_secs(5);

struct Harness {
    bus: InstanceEventBus,
    tracker: Arc<FakeInstanceTracker>,
    kill_service: Arc<RecordingKillService>,
    kills: mpsc::UnboundedReceiver<InstanceId>,
    launch_queue: Arc<FakeLaunchQueue>,
    launches: mpsc::UnboundedReceiver<Vec<InstanceId>>,
    readiness: Arc<ManualReadinessExecutor>,
    readiness_specs: mpsc::UnboundedReceiver<ReadinessCheckSpec>,
    updates: mpsc::UnboundedReceiver<ReadinessCheckUpdate>,
    completion: oneshot::Receiver<conifer_deploy::Result<()>>,
}

fn versions() -> (RunSpecVersion, RunSpecVersion) {
    let old = RunSpecVersion::at(Utc::now() - chrono::Duration::minutes(10));
    let target = RunSpecVersion::now();
    (old, target)
}

fn no_over_capacity(minimum_health_capacity: f64) -> UpgradeStrategy {
    UpgradeStrategy {
        minimum_health_capacity,
        maximum_over_capacity: 0.0,
    }
}

fn start(run_spec: RunSpec, tracker: Arc<FakeInstanceTracker>) -> Harness {
    start_with_kill_service(run_spec, tracker, RecordingKillService::new())
}

fn start_with_kill_service(
    run_spec: RunSpec,
    tracker: Arc<FakeInstanceTracker>,
    kill_service: (Arc<RecordingKillService>, mpsc::UnboundedReceiver<InstanceId>),
) -> Harness {
    let bus = InstanceEventBus::new();
    let (kill_service, kills) = kill_service;
    let (launch_queue, launches) = FakeLaunchQueue::new(Arc::clone(&tracker));
    let (readiness, readiness_specs) = ManualReadinessExecutor::new();
    let (updates_tx, updates) = mpsc::unbounded_channel();
    let (completion_tx, completion) = oneshot::channel();

    let controller = ReplacementController::new(
        updates_tx,
        DeploymentStatus {
            plan_id: "plan-1".to_string(),
            step: 0,
        },
        Arc::clone(&kill_service) as Arc<dyn conifer_deploy::KillService>,
        Arc::clone(&launch_queue) as Arc<dyn conifer_deploy::LaunchQueue>,
        Arc::clone(&tracker) as Arc<dyn conifer_deploy::InstanceTracker>,
        &bus,
        Arc::clone(&readiness) as Arc<dyn conifer_deploy::ReadinessCheckExecutor>,
        run_spec,
        completion_tx,
    );
    controller.spawn();

    Harness {
        bus,
        tracker,
        kill_service,
        kills,
        launch_queue,
        launches,
        readiness,
        readiness_specs,
        updates,
        completion,
    }
}

/// Confirm a kill the way a live cluster would: the instance goes terminal
/// and the tracker's event echoes back.
fn to_terminal(bus: &InstanceEventBus, tracker: &FakeInstanceTracker, id: &InstanceId) {
    let updated = tracker.update(id, |i| i.state.condition = Condition::Killed);
    bus.publish(InstanceEvent::Changed(InstanceChanged::new(updated)));
}

/// Bring a launched instance up: condition running, optionally healthy.
fn to_running(
    bus: &InstanceEventBus,
    tracker: &FakeInstanceTracker,
    id: &InstanceId,
    healthy: bool,
) {
    let updated = tracker.update(id, |i| {
        i.state.condition = Condition::Running;
        if healthy {
            i.state.healthy = Some(true);
        }
    });
    let version = updated.run_spec_version;
    let path_id = updated.app_id.clone();
    bus.publish(InstanceEvent::Changed(InstanceChanged::new(updated)));
    if healthy {
        bus.publish(InstanceEvent::HealthChanged(InstanceHealthChanged {
            id: id.clone(),
            run_spec_version: version,
            path_id,
            healthy: Some(true),
        }));
    }
}

/// React to kills and launches until the controller resolves its completion
/// signal.
async fn run_cluster(
    bus: &InstanceEventBus,
    tracker: &FakeInstanceTracker,
    kills: &mut mpsc::UnboundedReceiver<InstanceId>,
    launches: &mut mpsc::UnboundedReceiver<Vec<InstanceId>>,
    completion: &mut oneshot::Receiver<conifer_deploy::Result<()>>,
    healthy_on_launch: bool,
) -> conifer_deploy::Result<()> {
    loop {
        tokio::select! {
            killed = kills.recv() => {
                let id = killed.expect("kill service dropped");
                to_terminal(bus, tracker, &id);
            }
            launched = launches.recv() => {
                for id in launched.expect("launch queue dropped") {
                    to_running(bus, tracker, &id, healthy_on_launch);
                }
            }
            result = &mut *completion => {
                return result.expect("controller dropped its completion signal");
            }
        }
    }
}

#[tokio::test]
async fn happy_rolling_restart_replaces_every_instance() {
    let app = AppId::new("/web");
    let (old_version, target) = versions();
    let run_spec = RunSpec::new(app.clone(), target, 3)
        .with_upgrade_strategy(no_over_capacity(1.0))
        .with_health_check(HealthCheck::default());

    let tracker = FakeInstanceTracker::new();
    for n in 0..3 {
        let mut old = instance(&format!("old-{n}"), &app, old_version, Condition::Running);
        old.state.healthy = Some(true);
        tracker.upsert(old);
    }

    let mut harness = start(run_spec, tracker);
    let result = timeout(
        DEADLINE,
        run_cluster(
            &harness.bus,
            &harness.tracker,
            &mut harness.kills,
            &mut harness.launches,
            &mut harness.completion,
            true,
        ),
    )
    .await
    .expect("rolling restart timed out");
    result.expect("replacement failed");

    let kills = harness.kill_service.kills();
    assert_eq!(kills.len(), 3);
    assert!(kills.iter().all(|(_, reason)| *reason == KillReason::Upgrading));
    assert_eq!(harness.launch_queue.launched(), 3);

    // Non-resident instances are decommissioned, not merely stopped.
    let goals = harness.tracker.goal_log();
    assert_eq!(goals.len(), 3);
    assert!(goals.iter().all(|(_, goal)| *goal == Goal::Decommissioned));

    // The launch backoff of the previous version was cleared at startup.
    assert_eq!(harness.launch_queue.delay_resets(), 1);
}

#[tokio::test]
async fn resident_tight_upgrade_stops_instead_of_decommissioning() {
    let app = AppId::new("/db");
    let (old_version, target) = versions();
    let run_spec = RunSpec::new(app.clone(), target, 2)
        .with_upgrade_strategy(no_over_capacity(1.0))
        .with_health_check(HealthCheck::default())
        .resident();

    let tracker = FakeInstanceTracker::new();
    for n in 0..2 {
        let mut old = instance(&format!("old-{n}"), &app, old_version, Condition::Running);
        old.state.healthy = Some(true);
        tracker.upsert(old);
    }

    let mut harness = start(run_spec, tracker);
    let result = timeout(
        DEADLINE,
        run_cluster(
            &harness.bus,
            &harness.tracker,
            &mut harness.kills,
            &mut harness.launches,
            &mut harness.completion,
            true,
        ),
    )
    .await
    .expect("resident upgrade timed out");
    result.expect("replacement failed");

    assert_eq!(harness.kill_service.kills().len(), 2);
    assert_eq!(harness.launch_queue.launched(), 2);

    // Resident instances keep their volumes: the goal is stopped, never
    // decommissioned.
    let goals = harness.tracker.goal_log();
    assert_eq!(goals.len(), 2);
    assert!(goals.iter().all(|(_, goal)| *goal == Goal::Stopped));
}

#[tokio::test]
async fn over_capacity_instances_die_before_the_rolling_phase() {
    let app = AppId::new("/web");
    let (old_version, target) = versions();
    let run_spec = RunSpec::new(app.clone(), target, 2)
        .with_upgrade_strategy(no_over_capacity(1.0))
        .with_health_check(HealthCheck::default());

    let tracker = FakeInstanceTracker::new();
    for n in 0..4 {
        let mut old = instance(&format!("old-{n}"), &app, old_version, Condition::Running);
        old.state.healthy = Some(true);
        tracker.upsert(old);
    }

    let mut harness = start(run_spec, tracker);
    let result = timeout(
        DEADLINE,
        run_cluster(
            &harness.bus,
            &harness.tracker,
            &mut harness.kills,
            &mut harness.launches,
            &mut harness.completion,
            true,
        ),
    )
    .await
    .expect("scale-down upgrade timed out");
    result.expect("replacement failed");

    let kills = harness.kill_service.kills();
    assert_eq!(kills.len(), 4);
    // The immediate batch of two runs first, in id order, before any rolling
    // kill.
    assert_eq!(kills[0].0.as_str(), "old-0");
    assert_eq!(kills[1].0.as_str(), "old-1");
    assert_eq!(harness.launch_queue.launched(), 2);
}

#[tokio::test]
async fn readiness_gates_completion_until_the_probe_reports_ready() {
    let app = AppId::new("/api");
    let (old_version, target) = versions();
    let run_spec = RunSpec::new(app.clone(), target, 1)
        .with_upgrade_strategy(no_over_capacity(0.0))
        .with_readiness_check(ReadinessCheck::default());

    let tracker = FakeInstanceTracker::new();
    tracker.upsert(instance("old-0", &app, old_version, Condition::Running));

    let mut harness = start(run_spec, tracker);

    // The single old instance dies immediately and its replacement launches.
    let killed = timeout(DEADLINE, harness.kills.recv())
        .await
        .expect("no kill observed")
        .unwrap();
    to_terminal(&harness.bus, &harness.tracker, &killed);
    let launched = timeout(DEADLINE, harness.launches.recv())
        .await
        .expect("no launch observed")
        .unwrap();
    assert_eq!(launched.len(), 1);
    to_running(&harness.bus, &harness.tracker, &launched[0], false);

    // The controller subscribes a readiness stream for the new instance.
    let spec = timeout(DEADLINE, harness.readiness_specs.recv())
        .await
        .expect("no readiness subscription")
        .unwrap();
    assert_eq!(spec.instance_id, launched[0]);

    // Not-ready results are forwarded upstream but never complete the
    // deployment, and capacity admits no further launches.
    harness.readiness.push(&spec, false);
    let update = timeout(DEADLINE, harness.updates.recv())
        .await
        .expect("no readiness update")
        .unwrap();
    assert_eq!(update.plan_id, "plan-1");
    assert!(!update.result.ready);
    assert!(
        timeout(Duration::from_millis(200), &mut harness.completion)
            .await
            .is_err(),
        "deployment completed while the instance was not ready"
    );
    assert_eq!(harness.launch_queue.launched(), 1);

    // A ready result unsubscribes the stream and completes the deployment.
    harness.readiness.push(&spec, true);
    let result = timeout(DEADLINE, &mut harness.completion)
        .await
        .expect("deployment never completed")
        .expect("controller dropped its completion signal");
    result.expect("replacement failed");
}

#[tokio::test]
async fn tracker_miss_on_kill_is_not_fatal() {
    let app = AppId::new("/web");
    let (old_version, target) = versions();
    let run_spec = RunSpec::new(app.clone(), target, 1).with_upgrade_strategy(no_over_capacity(0.0));

    let tracker = FakeInstanceTracker::new();
    tracker.upsert(instance("old-0", &app, old_version, Condition::Running));
    tracker.mark_missing(&InstanceId::from_string("old-0".to_string()));

    let mut harness = start(run_spec, tracker);

    // The vanished instance is treated as already gone; once its terminal
    // state arrives the replacement proceeds normally.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.kill_service.kills().is_empty());
    assert!(harness.tracker.goal_log().is_empty());

    let gone = harness.tracker.update(&InstanceId::from_string("old-0".to_string()), |i| {
        i.state.condition = Condition::Killed;
        i.state.goal = Goal::Decommissioned;
    });
    harness
        .bus
        .publish(InstanceEvent::Changed(InstanceChanged::new(gone)));

    let launched = timeout(DEADLINE, harness.launches.recv())
        .await
        .expect("no launch observed")
        .unwrap();
    to_running(&harness.bus, &harness.tracker, &launched[0], false);

    let result = timeout(DEADLINE, &mut harness.completion)
        .await
        .expect("deployment never completed")
        .expect("controller dropped its completion signal");
    result.expect("replacement failed");
    assert!(harness.kill_service.kills().is_empty());
}

#[tokio::test]
async fn events_during_the_killing_phase_are_stashed_and_replayed() {
    let app = AppId::new("/web");
    let (old_version, target) = versions();
    let run_spec = RunSpec::new(app.clone(), target, 1).with_upgrade_strategy(no_over_capacity(0.0));

    let tracker = FakeInstanceTracker::new();
    tracker.upsert(instance("old-0", &app, old_version, Condition::Running));

    let (kill_service, kills, gate) = RecordingKillService::gated();
    let mut harness = start_with_kill_service(run_spec, tracker, (kill_service, kills));

    // While the kill is held open the controller sits in its killing phase;
    // the terminal event arriving now must be stashed, not lost.
    let old_id = InstanceId::from_string("old-0".to_string());
    let gone = harness.tracker.update(&old_id, |i| {
        i.state.condition = Condition::Killed;
        i.state.goal = Goal::Decommissioned;
    });
    harness
        .bus
        .publish(InstanceEvent::Changed(InstanceChanged::new(gone)));
    assert!(
        timeout(Duration::from_millis(200), &mut harness.completion)
            .await
            .is_err(),
        "deployment completed while the kill was still pending"
    );

    gate.add_permits(1);
    let killed = timeout(DEADLINE, harness.kills.recv())
        .await
        .expect("no kill observed")
        .unwrap();
    assert_eq!(killed, old_id);

    // Completion is only reachable through the stashed event: the old
    // instance's terminality was published before the kill resolved.
    let launched = timeout(DEADLINE, harness.launches.recv())
        .await
        .expect("no launch observed")
        .unwrap();
    to_running(&harness.bus, &harness.tracker, &launched[0], false);

    let result = timeout(DEADLINE, &mut harness.completion)
        .await
        .expect("deployment never completed")
        .expect("controller dropped its completion signal");
    result.expect("replacement failed");
    assert_eq!(harness.kill_service.kills().len(), 1);
}

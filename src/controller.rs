//! The replacement controller: a four-phase event-driven state machine that
//! drives every instance of an app from the current run-spec version to the
//! target version while honouring the upgrade policy.
//!
//! The controller is a single-consumer task. It owns one inbox fed by the
//! instance event bus and by its own background I/O, processes one message at
//! a time, and stashes messages the current phase does not accept. Stashed
//! messages are redelivered oldest-first when the controller returns to the
//! updating phase, before anything newly arrived.
//!
//! All I/O (tracker lookups, goal updates, kills, launches) runs on spawned
//! tasks whose completions re-enter the loop as messages, so no handler ever
//! blocks the loop. Kills of the initial batch are chained sequentially to
//! keep goal updates against the tracker ordered.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::RunSpec;
use crate::deps::{InstanceTracker, KillReason, KillService, LaunchQueue};
use crate::error::{ReplacementError, Result};
use crate::events::{InstanceChanged, InstanceEvent, InstanceEventBus, InstanceHealthChanged};
use crate::instance::{Condition, Goal, Instance, InstanceId};
use crate::readiness::{
    ReadinessCheckExecutor, ReadinessCheckResult, ReadinessCheckSpec, ReadinessKey,
    ReadinessSubscriptions,
};
use crate::strategy::RestartStrategy;

/// Identifies the deployment plan and step a controller executes on behalf of
/// the deployment supervisor.
#[derive(Debug, Clone)]
pub struct DeploymentStatus {
    /// Deployment plan id.
    pub plan_id: String,
    /// Index of the plan step this controller performs.
    pub step: usize,
}

/// Readiness progress forwarded to the deployment supervisor.
#[derive(Debug, Clone)]
pub struct ReadinessCheckUpdate {
    /// Deployment plan id.
    pub plan_id: String,
    /// The readiness result that was observed.
    pub result: ReadinessCheckResult,
}

/// Phase of the replacement state machine; exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Updating,
    Checking,
    Killing,
    Launching,
}

/// Messages processed by the controller loop.
#[derive(Debug)]
enum ControllerMessage {
    /// An instance changed, from the event bus.
    InstanceChanged(InstanceChanged),
    /// An instance's health changed, from the event bus.
    InstanceHealthChanged(InstanceHealthChanged),
    /// A readiness stream yielded a result.
    ReadinessResult {
        instance_id: InstanceId,
        result: ReadinessCheckResult,
    },
    /// A readiness stream completed.
    ReadinessStreamDone {
        key: ReadinessKey,
        error: Option<anyhow::Error>,
    },
    /// Evaluate the completion invariant.
    Check,
    /// Kill the initial batch of old instances.
    KillImmediately(usize),
    /// Kill at most one further old instance.
    KillNext,
    /// A kill pass finished for these instances.
    Killed(Vec<InstanceId>),
    /// Subscribe readiness streams for one new instance, if needed.
    ScheduleReadiness,
    /// Launch as many new instances as capacity permits.
    LaunchNext,
    /// The launch queue scheduled these instances.
    Scheduled(Vec<Instance>),
    /// A collaborator call failed; the controller must stop.
    Failed(ReplacementError),
}

enum Flow {
    Continue,
    Stop,
}

/// Drives one rolling replacement of a run spec to completion.
///
/// Created with an unresolved completion signal and a snapshot of current
/// instances; lives until every old-version instance is terminal and exactly
/// `target_instances` new-version instances are active, running, healthy, and
/// ready. On stop the controller drops its event subscription and cancels
/// every readiness stream it owns.
pub struct ReplacementController {
    run_spec: RunSpec,
    status: DeploymentStatus,
    deployment_manager: mpsc::UnboundedSender<ReadinessCheckUpdate>,
    instance_tracker: Arc<dyn InstanceTracker>,
    kill_service: Arc<dyn KillService>,
    launch_queue: Arc<dyn LaunchQueue>,
    readiness_executor: Arc<dyn ReadinessCheckExecutor>,
    events: broadcast::Receiver<InstanceEvent>,
    completion: Option<oneshot::Sender<Result<()>>>,

    phase: Phase,
    strategy: RestartStrategy,
    /// Optimistic overlay of the tracker's instances: kills and launches are
    /// written here before the authoritative event echoes back.
    instances: BTreeMap<InstanceId, Instance>,
    /// Sticky last-reported health per instance.
    instances_health: BTreeMap<InstanceId, bool>,
    /// Present once a readiness probe is scheduled; true once ready.
    instances_ready: BTreeMap<InstanceId, bool>,
    subscriptions: ReadinessSubscriptions,
    stash: VecDeque<ControllerMessage>,
    self_queue: VecDeque<ControllerMessage>,
    internal_tx: mpsc::UnboundedSender<ControllerMessage>,
    internal_rx: mpsc::UnboundedReceiver<ControllerMessage>,
}

impl ReplacementController {
    /// Create a controller for one deployment step.
    ///
    /// Subscribes to `event_bus` and snapshots the tracker immediately, so no
    /// event between construction and [`spawn`](Self::spawn) is lost. The
    /// ignition strategy is computed here; its preconditions are caller bugs
    /// and abort construction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployment_manager: mpsc::UnboundedSender<ReadinessCheckUpdate>,
        status: DeploymentStatus,
        kill_service: Arc<dyn KillService>,
        launch_queue: Arc<dyn LaunchQueue>,
        instance_tracker: Arc<dyn InstanceTracker>,
        event_bus: &InstanceEventBus,
        readiness_executor: Arc<dyn ReadinessCheckExecutor>,
        run_spec: RunSpec,
        completion: oneshot::Sender<Result<()>>,
    ) -> Self {
        let events = event_bus.subscribe();
        let instances: BTreeMap<InstanceId, Instance> = instance_tracker
            .spec_instances_sync(&run_spec.id)
            .into_iter()
            .map(|instance| (instance.id.clone(), instance))
            .collect();
        let instances_health = instances
            .values()
            .filter_map(|instance| instance.state.healthy.map(|h| (instance.id.clone(), h)))
            .collect();
        let running_count = instances
            .values()
            .filter(|instance| instance.state.condition == Condition::Running)
            .count();
        let strategy = RestartStrategy::compute(&run_spec, running_count);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        Self {
            run_spec,
            status,
            deployment_manager,
            instance_tracker,
            kill_service,
            launch_queue,
            readiness_executor,
            events,
            completion: Some(completion),
            phase: Phase::Updating,
            strategy,
            instances,
            instances_health,
            instances_ready: BTreeMap::new(),
            subscriptions: ReadinessSubscriptions::new(),
            stash: VecDeque::new(),
            self_queue: VecDeque::new(),
            internal_tx,
            internal_rx,
        }
    }

    /// Spawn the controller onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            app = %self.run_spec.id,
            version = %self.run_spec.version,
            plan = %self.status.plan_id,
            step = self.status.step,
            instances = self.instances.len(),
            nr_to_kill_immediately = self.strategy.nr_to_kill_immediately,
            max_capacity = self.strategy.max_capacity,
            "starting rolling replacement"
        );
        // A backoff accrued by the previous version must not stall the new
        // one.
        self.launch_queue.reset_delay(&self.run_spec).await;
        self.phase = Phase::Killing;
        self.self_queue.push_back(ControllerMessage::KillImmediately(
            self.strategy.nr_to_kill_immediately,
        ));

        loop {
            let message = self.next_message().await;
            match self.handle(message) {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
    }

    /// Next message in priority order: self-sends continuing the current
    /// transition, then (only while updating) stashed events, then background
    /// completions, then the event bus.
    async fn next_message(&mut self) -> ControllerMessage {
        if let Some(message) = self.self_queue.pop_front() {
            return message;
        }
        if self.phase == Phase::Updating {
            if let Some(message) = self.stash.pop_front() {
                debug!(app = %self.run_spec.id, "redelivering stashed event");
                return message;
            }
        }
        tokio::select! {
            biased;
            Some(message) = self.internal_rx.recv() => message,
            event = self.events.recv() => match event {
                Ok(InstanceEvent::Changed(changed)) => {
                    ControllerMessage::InstanceChanged(changed)
                }
                Ok(InstanceEvent::HealthChanged(health)) => {
                    ControllerMessage::InstanceHealthChanged(health)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    ControllerMessage::Failed(ReplacementError::EventBusLagged { skipped })
                }
                Err(broadcast::error::RecvError::Closed) => {
                    ControllerMessage::Failed(ReplacementError::DeploymentAborted {
                        reason: "instance event bus closed".to_string(),
                    })
                }
            },
        }
    }

    fn handle(&mut self, message: ControllerMessage) -> Flow {
        let message = match message {
            ControllerMessage::Failed(error) => return self.fail(error),
            other => other,
        };
        match self.phase {
            Phase::Updating => self.on_updating(message),
            Phase::Checking => self.on_checking(message),
            Phase::Killing => self.on_killing(message),
            Phase::Launching => self.on_launching(message),
        }
    }

    fn on_updating(&mut self, message: ControllerMessage) -> Flow {
        match message {
            ControllerMessage::InstanceChanged(changed) => {
                if changed.instance.app_id != self.run_spec.id {
                    return Flow::Continue;
                }
                debug!(
                    app = %self.run_spec.id,
                    instance = %changed.id,
                    condition = ?changed.condition,
                    "instance changed"
                );
                self.instances.insert(changed.id.clone(), changed.instance);
                self.start_check()
            }
            ControllerMessage::InstanceHealthChanged(health) => {
                if health.path_id != self.run_spec.id {
                    return Flow::Continue;
                }
                if let Some(healthy) = health.healthy {
                    debug!(
                        app = %self.run_spec.id,
                        instance = %health.id,
                        healthy,
                        "instance health changed"
                    );
                    self.instances_health.insert(health.id.clone(), healthy);
                }
                self.start_check()
            }
            ControllerMessage::ReadinessResult {
                instance_id,
                result,
            } => {
                let update = ReadinessCheckUpdate {
                    plan_id: self.status.plan_id.clone(),
                    result: result.clone(),
                };
                if self.deployment_manager.send(update).is_err() {
                    debug!(
                        app = %self.run_spec.id,
                        "deployment supervisor gone, dropping readiness update"
                    );
                }
                if result.ready {
                    info!(
                        app = %self.run_spec.id,
                        instance = %instance_id,
                        check = %result.name,
                        "instance is ready"
                    );
                    self.instances_ready.insert(instance_id, true);
                    self.subscriptions.unsubscribe(&ReadinessKey {
                        task_id: result.task_id,
                        check_name: result.name,
                    });
                }
                self.start_check()
            }
            ControllerMessage::ReadinessStreamDone { key, error } => {
                match error {
                    Some(error) => {
                        error!(
                            app = %self.run_spec.id,
                            task = %key.task_id,
                            check = %key.check_name,
                            %error,
                            "readiness stream failed"
                        );
                        // Let the next launching pass subscribe the instance
                        // again if it never reported ready.
                        let owner = self
                            .instances
                            .values()
                            .find(|i| i.tasks.contains_key(&key.task_id))
                            .map(|i| i.id.clone());
                        if let Some(owner) = owner {
                            if self.instances_ready.get(&owner) == Some(&false) {
                                self.instances_ready.remove(&owner);
                            }
                        }
                    }
                    None => debug!(
                        app = %self.run_spec.id,
                        task = %key.task_id,
                        check = %key.check_name,
                        "readiness stream completed"
                    ),
                }
                self.subscriptions.forget(&key);
                self.start_check()
            }
            // Phase-internal messages never reach the updating phase; they
            // are consumed in the phase that sent them.
            other => {
                warn!(app = %self.run_spec.id, message = ?other, "dropping unexpected message");
                Flow::Continue
            }
        }
    }

    fn on_checking(&mut self, message: ControllerMessage) -> Flow {
        match message {
            ControllerMessage::Check => {
                if self.replacement_done() {
                    return self.finish();
                }
                self.phase = Phase::Killing;
                self.self_queue.push_back(ControllerMessage::KillNext);
                Flow::Continue
            }
            other => self.stash(other),
        }
    }

    fn on_killing(&mut self, message: ControllerMessage) -> Flow {
        match message {
            ControllerMessage::KillImmediately(count) => {
                let doomed: Vec<InstanceId> = self.old_goal_running().take(count).collect();
                info!(
                    app = %self.run_spec.id,
                    count = doomed.len(),
                    "killing the initial batch of old instances"
                );
                self.start_kill_chain(doomed);
                Flow::Continue
            }
            ControllerMessage::KillNext => {
                let next = self.old_goal_running().next();
                match next {
                    Some(id) => {
                        debug!(app = %self.run_spec.id, instance = %id, "killing next old instance");
                        self.start_kill_chain(vec![id]);
                    }
                    None => {
                        self.self_queue
                            .push_back(ControllerMessage::Killed(Vec::new()));
                    }
                }
                Flow::Continue
            }
            ControllerMessage::Killed(ids) => {
                // Write-ahead: record the goal locally so the next kill pass
                // does not select the same instance again before the
                // tracker's update arrives.
                for id in &ids {
                    if let Some(instance) = self.instances.get_mut(id) {
                        instance.state.goal = Goal::Stopped;
                    }
                }
                self.phase = Phase::Launching;
                self.self_queue
                    .push_back(ControllerMessage::ScheduleReadiness);
                Flow::Continue
            }
            other => self.stash(other),
        }
    }

    fn on_launching(&mut self, message: ControllerMessage) -> Flow {
        match message {
            ControllerMessage::ScheduleReadiness => {
                if self.run_spec.has_readiness_checks() {
                    self.subscribe_next_unready();
                }
                self.self_queue.push_back(ControllerMessage::LaunchNext);
                Flow::Continue
            }
            ControllerMessage::LaunchNext => {
                let target = self.run_spec.version;
                let old_total = self
                    .instances
                    .values()
                    .filter(|i| i.run_spec_version < target)
                    .count();
                let old_terminal = self
                    .instances
                    .values()
                    .filter(|i| {
                        i.run_spec_version < target
                            && i.state.condition.consider_terminal()
                            && i.state.goal != Goal::Running
                    })
                    .count();
                let new_started = self
                    .instances
                    .values()
                    .filter(|i| i.run_spec_version == target && i.state.goal == Goal::Running)
                    .count();
                self.launch_instances(old_total - old_terminal, new_started);
                Flow::Continue
            }
            ControllerMessage::Scheduled(scheduled) => {
                // Write-ahead: count freshly scheduled instances against
                // capacity before the tracker echoes them back.
                for mut instance in scheduled {
                    instance.state.goal = Goal::Running;
                    instance.run_spec_version = self.run_spec.version;
                    self.instances.insert(instance.id.clone(), instance);
                }
                self.phase = Phase::Updating;
                Flow::Continue
            }
            other => self.stash(other),
        }
    }

    /// The completion invariant: every old-version instance has gone terminal
    /// and is no longer goal-running, and exactly `target_instances`
    /// new-version instances are active, running, healthy, and ready.
    fn replacement_done(&self) -> bool {
        let target = self.run_spec.version;
        let old_all_terminal = self
            .instances
            .values()
            .filter(|i| i.run_spec_version < target)
            .all(|i| i.state.condition.consider_terminal() && i.state.goal != Goal::Running);
        let new_active = self
            .instances
            .values()
            .filter(|i| self.counts_as_active(i))
            .count();
        debug!(
            app = %self.run_spec.id,
            old_all_terminal,
            new_active,
            target_instances = self.run_spec.target_instances,
            "checked replacement progress"
        );
        old_all_terminal && new_active == self.run_spec.target_instances as usize
    }

    fn counts_as_active(&self, instance: &Instance) -> bool {
        instance.run_spec_version == self.run_spec.version
            && instance.state.condition.is_active()
            && instance.state.goal == Goal::Running
            && (!self.run_spec.has_health_checks()
                || self
                    .instances_health
                    .get(&instance.id)
                    .copied()
                    .unwrap_or(false))
            && (!self.run_spec.has_readiness_checks()
                || self
                    .instances_ready
                    .get(&instance.id)
                    .copied()
                    .unwrap_or(false))
    }

    /// Old-version instances the operator still wants running, in id order.
    fn old_goal_running(&self) -> impl Iterator<Item = InstanceId> + '_ {
        let target = self.run_spec.version;
        self.instances
            .values()
            .filter(move |i| i.run_spec_version < target && i.state.goal == Goal::Running)
            .map(|i| i.id.clone())
    }

    /// Kill `doomed` one at a time on a background task. The chain completion
    /// re-enters the loop as `Killed`; a collaborator failure as `Failed`.
    fn start_kill_chain(&self, doomed: Vec<InstanceId>) {
        let tracker = Arc::clone(&self.instance_tracker);
        let kill_service = Arc::clone(&self.kill_service);
        let resident = self.run_spec.is_resident;
        let sender = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut killed = Vec::with_capacity(doomed.len());
            for id in doomed {
                match kill_one(tracker.as_ref(), kill_service.as_ref(), &id, resident).await {
                    Ok(()) => killed.push(id),
                    Err(error) => {
                        let _ = sender.send(ControllerMessage::Failed(error));
                        return;
                    }
                }
            }
            let _ = sender.send(ControllerMessage::Killed(killed));
        });
    }

    /// Subscribe readiness streams for the first new instance that has none
    /// yet.
    fn subscribe_next_unready(&mut self) {
        let target = self.run_spec.version;
        let candidate = self
            .instances
            .values()
            .find(|i| {
                i.run_spec_version == target
                    && i.state.condition.is_active()
                    && i.state.goal == Goal::Running
                    && !self.instances_ready.contains_key(&i.id)
            })
            .cloned();
        let Some(instance) = candidate else {
            return;
        };
        info!(
            app = %self.run_spec.id,
            instance = %instance.id,
            checks = self.run_spec.readiness_checks.len(),
            tasks = instance.tasks.len(),
            "subscribing readiness checks"
        );
        for task in instance.tasks.values() {
            for check in &self.run_spec.readiness_checks {
                let spec = ReadinessCheckSpec::for_task(&instance, task, check);
                let key = spec.key();
                let probe = self.readiness_executor.execute(spec);
                let result_tx = self.internal_tx.clone();
                let done_tx = self.internal_tx.clone();
                let instance_id = instance.id.clone();
                self.subscriptions.subscribe(
                    key,
                    probe,
                    move |result| {
                        let _ = result_tx.send(ControllerMessage::ReadinessResult {
                            instance_id: instance_id.clone(),
                            result,
                        });
                    },
                    move |key, error| {
                        let _ = done_tx.send(ControllerMessage::ReadinessStreamDone {
                            key,
                            error,
                        });
                    },
                );
            }
        }
        self.instances_ready.insert(instance.id, false);
    }

    /// Queue as many new instances as the capacity ceiling permits.
    fn launch_instances(&mut self, old_outstanding: usize, new_started: usize) {
        let left_capacity = self
            .strategy
            .max_capacity
            .saturating_sub(old_outstanding + new_started);
        let want = (self.run_spec.target_instances as usize).saturating_sub(new_started);
        let count = want.min(left_capacity);
        if count == 0 {
            debug!(
                app = %self.run_spec.id,
                old_outstanding,
                new_started,
                "no capacity for new instances"
            );
            self.self_queue
                .push_back(ControllerMessage::Scheduled(Vec::new()));
            return;
        }
        info!(
            app = %self.run_spec.id,
            count,
            old_outstanding,
            new_started,
            "queueing new instances"
        );
        let launch_queue = Arc::clone(&self.launch_queue);
        let run_spec = self.run_spec.clone();
        let sender = self.internal_tx.clone();
        tokio::spawn(async move {
            match launch_queue.add_with_reply(&run_spec, count).await {
                Ok(scheduled) => {
                    let _ = sender.send(ControllerMessage::Scheduled(scheduled));
                }
                Err(error) => {
                    let _ = sender.send(ControllerMessage::Failed(
                        ReplacementError::LaunchFailure {
                            count,
                            source: error.into(),
                        },
                    ));
                }
            }
        });
    }

    fn start_check(&mut self) -> Flow {
        self.phase = Phase::Checking;
        self.self_queue.push_back(ControllerMessage::Check);
        Flow::Continue
    }

    fn stash(&mut self, message: ControllerMessage) -> Flow {
        debug!(app = %self.run_spec.id, phase = ?self.phase, "stashing message for later");
        self.stash.push_back(message);
        Flow::Continue
    }

    fn finish(&mut self) -> Flow {
        info!(
            app = %self.run_spec.id,
            version = %self.run_spec.version,
            "rolling replacement complete"
        );
        self.subscriptions.cancel_all();
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Ok(()));
        }
        Flow::Stop
    }

    fn fail(&mut self, error: ReplacementError) -> Flow {
        error!(app = %self.run_spec.id, %error, "rolling replacement failed");
        self.subscriptions.cancel_all();
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Err(error));
        }
        Flow::Stop
    }
}

/// Kill one instance: persist the goal, then hand it to the kill service.
///
/// An instance the tracker no longer knows is treated as already gone.
/// Resident instances are stopped so their volumes survive; everything else
/// is decommissioned.
async fn kill_one(
    tracker: &dyn InstanceTracker,
    kill_service: &dyn KillService,
    id: &InstanceId,
    resident: bool,
) -> Result<()> {
    let instance = tracker
        .get(id)
        .await
        .map_err(|error| ReplacementError::TrackerFailure {
            source: error.into(),
        })?;
    let Some(instance) = instance else {
        warn!(instance = %id, "instance vanished before kill, treating as done");
        return Ok(());
    };
    let goal = if resident {
        Goal::Stopped
    } else {
        Goal::Decommissioned
    };
    tracker
        .set_goal(id, goal)
        .await
        .map_err(|error| ReplacementError::TrackerFailure {
            source: error.into(),
        })?;
    kill_service
        .kill_instance(&instance, KillReason::Upgrading)
        .await
        .map_err(|error| ReplacementError::KillFailure {
            id: id.clone(),
            source: error.into(),
        })?;
    Ok(())
}

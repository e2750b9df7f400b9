//! In-memory collaborators for exercising the replacement controller.
//!
//! Deterministic doubles: state lives behind plain mutexes and every side
//! effect is observable through a channel, so scenario tests can drive the
//! controller event by event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::app::{AppId, RunSpec, RunSpecVersion};
use crate::deps::{InstanceTracker, KillReason, KillService, LaunchQueue};
use crate::instance::{Condition, Goal, Instance, InstanceId, InstanceState, Task, TaskId};
use crate::readiness::{
    ReadinessCheckExecutor, ReadinessCheckResult, ReadinessCheckSpec, ReadinessProbe,
};

/// Build a goal-running instance in the given condition, with one task.
pub fn instance(id: &str, app_id: &AppId, version: RunSpecVersion, condition: Condition) -> Instance {
    let now = Utc::now();
    let task_id = TaskId::from_string(format!("{id}.task-0"));
    Instance {
        id: InstanceId::from_string(id.to_string()),
        app_id: app_id.clone(),
        run_spec_version: version,
        state: InstanceState {
            goal: Goal::Running,
            condition,
            healthy: None,
            active_since: Some(now),
            since: now,
        },
        tasks: BTreeMap::from([(
            task_id.clone(),
            Task {
                id: task_id,
                staged_at: now,
            },
        )]),
    }
}

/// In-memory instance tracker.
#[derive(Default)]
pub struct FakeInstanceTracker {
    instances: Mutex<BTreeMap<InstanceId, Instance>>,
    missing: Mutex<BTreeSet<InstanceId>>,
    goals: Mutex<Vec<(InstanceId, Goal)>>,
}

impl FakeInstanceTracker {
    /// Create an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace an instance.
    pub fn upsert(&self, instance: Instance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
    }

    /// Mutate a stored instance in place and return the updated record.
    pub fn update<F>(&self, id: &InstanceId, mutate: F) -> Instance
    where
        F: FnOnce(&mut Instance),
    {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(id).expect("unknown instance");
        mutate(instance);
        instance.clone()
    }

    /// Make `get` report the instance as gone.
    pub fn mark_missing(&self, id: &InstanceId) {
        self.missing.lock().unwrap().insert(id.clone());
    }

    /// Goals persisted via `set_goal`, oldest first.
    pub fn goal_log(&self) -> Vec<(InstanceId, Goal)> {
        self.goals.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceTracker for FakeInstanceTracker {
    fn spec_instances_sync(&self, app_id: &AppId) -> Vec<Instance> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .filter(|instance| &instance.app_id == app_id)
            .cloned()
            .collect()
    }

    async fn get(&self, id: &InstanceId) -> anyhow::Result<Option<Instance>> {
        if self.missing.lock().unwrap().contains(id) {
            return Ok(None);
        }
        Ok(self.instances.lock().unwrap().get(id).cloned())
    }

    async fn set_goal(&self, id: &InstanceId, goal: Goal) -> anyhow::Result<()> {
        self.goals.lock().unwrap().push((id.clone(), goal));
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.state.goal = goal;
        }
        Ok(())
    }
}

/// Kill service that records every kill and reports it on a channel.
pub struct RecordingKillService {
    kills: Mutex<Vec<(InstanceId, KillReason)>>,
    notify: mpsc::UnboundedSender<InstanceId>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingKillService {
    /// Create a kill service that answers immediately.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<InstanceId>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                kills: Mutex::new(Vec::new()),
                notify,
                gate: None,
            }),
            receiver,
        )
    }

    /// Create a kill service that holds each kill until the returned
    /// semaphore receives a permit.
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<InstanceId>, Arc<Semaphore>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        (
            Arc::new(Self {
                kills: Mutex::new(Vec::new()),
                notify,
                gate: Some(Arc::clone(&gate)),
            }),
            receiver,
            gate,
        )
    }

    /// Kills recorded so far, oldest first.
    pub fn kills(&self) -> Vec<(InstanceId, KillReason)> {
        self.kills.lock().unwrap().clone()
    }
}

#[async_trait]
impl KillService for RecordingKillService {
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> anyhow::Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("kill gate closed").forget();
        }
        self.kills
            .lock()
            .unwrap()
            .push((instance.id.clone(), reason));
        let _ = self.notify.send(instance.id.clone());
        Ok(())
    }
}

/// Launch queue that mints instances of the requested run spec and registers
/// them with the tracker.
pub struct FakeLaunchQueue {
    tracker: Arc<FakeInstanceTracker>,
    counter: AtomicUsize,
    delay_resets: AtomicUsize,
    notify: mpsc::UnboundedSender<Vec<InstanceId>>,
}

impl FakeLaunchQueue {
    /// Create a launch queue backed by `tracker`.
    pub fn new(
        tracker: Arc<FakeInstanceTracker>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<InstanceId>>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tracker,
                counter: AtomicUsize::new(0),
                delay_resets: AtomicUsize::new(0),
                notify,
            }),
            receiver,
        )
    }

    /// Number of `reset_delay` calls observed.
    pub fn delay_resets(&self) -> usize {
        self.delay_resets.load(Ordering::SeqCst)
    }

    /// Total number of instances minted so far.
    pub fn launched(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LaunchQueue for FakeLaunchQueue {
    async fn reset_delay(&self, _run_spec: &RunSpec) {
        self.delay_resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn add_with_reply(
        &self,
        run_spec: &RunSpec,
        count: usize,
    ) -> anyhow::Result<Vec<Instance>> {
        let mut scheduled = Vec::with_capacity(count);
        for _ in 0..count {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let new = instance(
                &format!("new-{n}"),
                &run_spec.id,
                run_spec.version,
                Condition::Provisioned,
            );
            self.tracker.upsert(new.clone());
            scheduled.push(new);
        }
        let _ = self
            .notify
            .send(scheduled.iter().map(|i| i.id.clone()).collect());
        Ok(scheduled)
    }
}

/// Readiness executor whose result streams are fed by the test.
pub struct ManualReadinessExecutor {
    streams: Mutex<BTreeMap<(TaskId, String), mpsc::UnboundedSender<anyhow::Result<ReadinessCheckResult>>>>,
    notify: mpsc::UnboundedSender<ReadinessCheckSpec>,
}

impl ManualReadinessExecutor {
    /// Create an executor; the receiver reports every `execute` call.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ReadinessCheckSpec>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                streams: Mutex::new(BTreeMap::new()),
                notify,
            }),
            receiver,
        )
    }

    /// Push a probe result on the stream started for `spec`.
    pub fn push(&self, spec: &ReadinessCheckSpec, ready: bool) {
        let streams = self.streams.lock().unwrap();
        let sender = streams
            .get(&(spec.task_id.clone(), spec.check_name.clone()))
            .expect("no stream for spec");
        let _ = sender.send(Ok(ReadinessCheckResult {
            name: spec.check_name.clone(),
            task_id: spec.task_id.clone(),
            ready,
            last_response: None,
        }));
    }

    /// End the stream started for `spec`.
    pub fn complete(&self, spec: &ReadinessCheckSpec) {
        self.streams
            .lock()
            .unwrap()
            .remove(&(spec.task_id.clone(), spec.check_name.clone()));
    }
}

impl ReadinessCheckExecutor for ManualReadinessExecutor {
    fn execute(&self, spec: ReadinessCheckSpec) -> ReadinessProbe {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .insert((spec.task_id.clone(), spec.check_name.clone()), sender);
        let _ = self.notify.send(spec);
        ReadinessProbe {
            cancel: CancellationToken::new(),
            results: UnboundedReceiverStream::new(receiver).boxed(),
        }
    }
}

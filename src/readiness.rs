//! Readiness probes: the executor contract, per-check subscriptions, and
//! probe results.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::ReadinessCheck;
use crate::instance::{Instance, InstanceId, Task, TaskId};

/// Key identifying one readiness stream: the probed task and the check name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadinessKey {
    /// Task being probed.
    pub task_id: TaskId,
    /// Name of the readiness check.
    pub check_name: String,
}

/// Everything an executor needs to probe one task for one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheckSpec {
    /// Instance the probed task belongs to.
    pub instance_id: InstanceId,
    /// Task being probed.
    pub task_id: TaskId,
    /// Name of the readiness check.
    pub check_name: String,
    /// HTTP path probed on the task.
    pub path: String,
    /// Named port the probe connects to.
    pub port_name: String,
    /// Interval between probes.
    pub interval: Duration,
    /// Probe timeout.
    pub timeout: Duration,
}

impl ReadinessCheckSpec {
    /// Build the spec for probing `task` of `instance` with `check`.
    pub fn for_task(instance: &Instance, task: &Task, check: &ReadinessCheck) -> Self {
        Self {
            instance_id: instance.id.clone(),
            task_id: task.id.clone(),
            check_name: check.name.clone(),
            path: check.path.clone(),
            port_name: check.port_name.clone(),
            interval: check.interval,
            timeout: check.timeout,
        }
    }

    /// The subscription key for this spec.
    pub fn key(&self) -> ReadinessKey {
        ReadinessKey {
            task_id: self.task_id.clone(),
            check_name: self.check_name.clone(),
        }
    }
}

/// One result yielded by a readiness stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheckResult {
    /// Name of the readiness check.
    pub name: String,
    /// Task that was probed.
    pub task_id: TaskId,
    /// True once the task answers "ready for traffic".
    pub ready: bool,
    /// Body of the last probe response, when the executor captured one.
    pub last_response: Option<serde_json::Value>,
}

/// A running readiness probe: its result stream plus a cancellation handle.
pub struct ReadinessProbe {
    /// Cancels the probe. Cancellation is idempotent.
    pub cancel: CancellationToken,
    /// Lazy stream of probe results; ends when the executor stops probing.
    pub results: BoxStream<'static, anyhow::Result<ReadinessCheckResult>>,
}

/// Executes readiness checks against live tasks.
pub trait ReadinessCheckExecutor: Send + Sync {
    /// Start probing per `spec`; the probe runs until cancelled or exhausted.
    fn execute(&self, spec: ReadinessCheckSpec) -> ReadinessProbe;
}

/// Registry of the readiness streams a controller currently owns.
///
/// Every subscription is backed by a forwarder task piping stream results
/// into the supplied callbacks. A stream that runs to completion fires
/// `on_done` exactly once; a cancelled stream fires neither callback again.
#[derive(Default)]
pub struct ReadinessSubscriptions {
    subscriptions: BTreeMap<ReadinessKey, CancellationToken>,
}

impl ReadinessSubscriptions {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check whether no subscriptions are live.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Track `probe` under `key`, forwarding each result to `on_result` and
    /// the stream end to `on_done`.
    pub fn subscribe<F, G>(&mut self, key: ReadinessKey, probe: ReadinessProbe, on_result: F, on_done: G)
    where
        F: Fn(ReadinessCheckResult) + Send + 'static,
        G: FnOnce(ReadinessKey, Option<anyhow::Error>) + Send + 'static,
    {
        if self.subscriptions.contains_key(&key) {
            warn!(
                task = %key.task_id,
                check = %key.check_name,
                "readiness stream already subscribed, replacing"
            );
            self.unsubscribe(&key);
        }

        let cancel = probe.cancel.clone();
        self.subscriptions.insert(key.clone(), probe.cancel);
        let mut results = probe.results;
        tokio::spawn(async move {
            let ended = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = results.next() => match next {
                        Some(Ok(result)) => on_result(result),
                        Some(Err(error)) => break Some(error),
                        None => break None,
                    },
                }
            };
            on_done(key, ended);
        });
    }

    /// Cancel and forget the stream registered under `key`.
    pub fn unsubscribe(&mut self, key: &ReadinessKey) {
        if let Some(cancel) = self.subscriptions.remove(key) {
            debug!(task = %key.task_id, check = %key.check_name, "cancelling readiness stream");
            cancel.cancel();
        }
    }

    /// Forget the stream registered under `key` after it completed on its
    /// own.
    pub fn forget(&mut self, key: &ReadinessKey) {
        self.subscriptions.remove(key);
    }

    /// Cancel every live stream.
    pub fn cancel_all(&mut self) {
        for (key, cancel) in std::mem::take(&mut self.subscriptions) {
            debug!(task = %key.task_id, check = %key.check_name, "cancelling readiness stream");
            cancel.cancel();
        }
    }
}

impl Drop for ReadinessSubscriptions {
    fn drop(&mut self) {
        for cancel in self.subscriptions.values() {
            cancel.cancel();
        }
    }
}

//! Contracts of the controller's side-effecting collaborators.
//!
//! One focused trait per capability, so embedders compose what they have and
//! test doubles only implement what they use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::{AppId, RunSpec};
use crate::instance::{Goal, Instance, InstanceId};

/// Authoritative store of instances.
#[async_trait]
pub trait InstanceTracker: Send + Sync {
    /// Synchronous snapshot of all instances of an app. Used once at
    /// controller startup.
    fn spec_instances_sync(&self, app_id: &AppId) -> Vec<Instance>;

    /// Look up the current record of an instance.
    async fn get(&self, id: &InstanceId) -> anyhow::Result<Option<Instance>>;

    /// Persist a new goal for an instance.
    async fn set_goal(&self, id: &InstanceId, goal: Goal) -> anyhow::Result<()>;
}

/// Why an instance is being killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillReason {
    /// Replaced by a newer version during a rolling upgrade.
    Upgrading,
    /// Running above the target instance count.
    OverCapacity,
    /// Scaled down by the operator.
    ScalingDown,
    /// Selected by a scaling proposition for decommission.
    DecommissionScheduled,
}

/// Performs the actual termination of instances.
#[async_trait]
pub trait KillService: Send + Sync {
    /// Kill an instance, recording `reason`.
    async fn kill_instance(&self, instance: &Instance, reason: KillReason)
        -> anyhow::Result<()>;
}

/// Schedules new instances for launch.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    /// Clear any launch backoff accrued for the run spec.
    async fn reset_delay(&self, run_spec: &RunSpec);

    /// Queue `count` new instances and return their freshly scheduled
    /// records.
    async fn add_with_reply(
        &self,
        run_spec: &RunSpec,
        count: usize,
    ) -> anyhow::Result<Vec<Instance>>;
}

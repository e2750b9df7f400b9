//! Instance model: identity, operator goal, observed condition, and tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::{AppId, RunSpecVersion};

/// Unique identifier for an instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create a new unique instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an instance ID from a string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a task within an instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a task ID from a string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The operator's intent for an instance, distinct from its observed
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Goal {
    /// The instance should be running.
    Running,
    /// The instance should be stopped; its reservation and volumes survive.
    Stopped,
    /// The instance should be stopped and its resources released.
    Decommissioned,
}

/// Observed lifecycle condition of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Resources are reserved but nothing has been launched yet.
    Provisioned,
    /// Accepted by the scheduler, waiting for placement.
    Scheduled,
    /// Being fetched and set up on an agent.
    Staging,
    /// Launched, not yet reported running.
    Starting,
    /// Reported running by its agent.
    Running,
    /// A kill has been issued and not yet confirmed.
    Killing,
    /// The agent stopped reporting; the instance may still be alive.
    Unreachable,
    /// Unreachable past the grace period; treated as gone.
    UnreachableInactive,
    /// Exited with a failure.
    Failed,
    /// Exited successfully.
    Finished,
    /// Kill confirmed.
    Killed,
    /// Rejected or lost by the platform.
    Error,
}

impl Condition {
    /// Check if the condition is non-terminal.
    pub fn is_active(&self) -> bool {
        !self.consider_terminal()
    }

    /// Check if the instance should be considered gone for replacement
    /// purposes.
    pub fn consider_terminal(&self) -> bool {
        matches!(
            self,
            Self::UnreachableInactive | Self::Failed | Self::Finished | Self::Killed | Self::Error
        )
    }
}

/// A task running inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID.
    pub id: TaskId,
    /// When the task was staged onto an agent.
    pub staged_at: DateTime<Utc>,
}

/// Mutable state of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// The operator's intent.
    pub goal: Goal,
    /// The observed condition.
    pub condition: Condition,
    /// Last reported aggregate health; absent when unreported.
    pub healthy: Option<bool>,
    /// When the instance last became active.
    pub active_since: Option<DateTime<Utc>>,
    /// When the current condition was entered.
    pub since: DateTime<Utc>,
}

/// A single instance of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance ID.
    pub id: InstanceId,
    /// App this instance belongs to.
    pub app_id: AppId,
    /// Run-spec version the instance was launched from.
    pub run_spec_version: RunSpecVersion,
    /// Current state.
    pub state: InstanceState,
    /// Tasks by ID.
    pub tasks: BTreeMap<TaskId, Task>,
}

impl Instance {
    /// Latest staging timestamp across the instance's tasks.
    pub fn latest_staged_at(&self) -> Option<DateTime<Utc>> {
        self.tasks.values().map(|task| task.staged_at).max()
    }

    /// Check if the operator wants this instance running.
    pub fn is_goal_running(&self) -> bool {
        self.state.goal == Goal::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_conditions_are_not_active() {
        let terminal = [
            Condition::UnreachableInactive,
            Condition::Failed,
            Condition::Finished,
            Condition::Killed,
            Condition::Error,
        ];
        for condition in terminal {
            assert!(condition.consider_terminal());
            assert!(!condition.is_active());
        }
    }

    #[test]
    fn unreachable_is_still_active() {
        assert!(Condition::Unreachable.is_active());
        assert!(Condition::Killing.is_active());
        assert!(!Condition::Unreachable.consider_terminal());
    }
}

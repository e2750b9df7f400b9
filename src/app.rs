//! Run specification: app identity, scaling target, and upgrade policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an app, the path of its run spec.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    /// Create an app ID from a path.
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self(path.into())
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of a run spec. Versions are creation timestamps and totally
/// ordered, so "older than the target version" is a plain comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RunSpecVersion(DateTime<Utc>);

impl RunSpecVersion {
    /// Version stamped with the current time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Version at a specific instant.
    pub fn at(when: DateTime<Utc>) -> Self {
        Self(when)
    }
}

impl std::fmt::Display for RunSpecVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Capacity policy applied while an app is upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Fraction of the target count that must stay healthy during an
    /// upgrade, in `[0, 1]`.
    pub minimum_health_capacity: f64,
    /// Fraction of the target count that may run additionally during an
    /// upgrade, `>= 0`.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

/// Health check declared on a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Grace period before failures count.
    pub grace_period: Duration,
    /// Interval between probes.
    pub interval: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            name: "health".to_string(),
            grace_period: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

/// Readiness check declared on a run spec, probed after an instance is
/// healthy as an application-level "ready for traffic" gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    /// Check name.
    pub name: String,
    /// HTTP path probed on the task.
    pub path: String,
    /// Named port the probe connects to.
    pub port_name: String,
    /// Interval between probes.
    pub interval: Duration,
    /// Probe timeout.
    pub timeout: Duration,
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self {
            name: "readinessCheck".to_string(),
            path: "/".to_string(),
            port_name: "http".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Tie-break policy choosing between otherwise-equivalent kill candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillSelection {
    /// Prefer killing the instance that became active most recently.
    #[default]
    YoungestFirst,
    /// Prefer killing the instance that became active longest ago.
    OldestFirst,
}

/// Immutable description of one version of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// App identifier.
    pub id: AppId,
    /// Version of this run spec.
    pub version: RunSpecVersion,
    /// Desired number of instances, at least one.
    pub target_instances: u32,
    /// Upgrade capacity policy.
    pub upgrade_strategy: UpgradeStrategy,
    /// True if instances bind to persistent local volumes and therefore must
    /// never be decommissioned, only stopped.
    pub is_resident: bool,
    /// Health checks evaluated by the health monitor.
    pub health_checks: Vec<HealthCheck>,
    /// Readiness checks gating "ready for traffic".
    pub readiness_checks: Vec<ReadinessCheck>,
    /// Kill candidate tie-break policy.
    pub kill_selection: KillSelection,
}

impl RunSpec {
    /// Create a run spec with the default upgrade policy and no checks.
    pub fn new(id: AppId, version: RunSpecVersion, target_instances: u32) -> Self {
        assert!(
            target_instances > 0,
            "run spec must target at least one instance"
        );
        Self {
            id,
            version,
            target_instances,
            upgrade_strategy: UpgradeStrategy::default(),
            is_resident: false,
            health_checks: Vec::new(),
            readiness_checks: Vec::new(),
            kill_selection: KillSelection::default(),
        }
    }

    /// Set the upgrade strategy.
    pub fn with_upgrade_strategy(mut self, strategy: UpgradeStrategy) -> Self {
        self.upgrade_strategy = strategy;
        self
    }

    /// Mark instances as resident.
    pub fn resident(mut self) -> Self {
        self.is_resident = true;
        self
    }

    /// Add a health check.
    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_checks.push(check);
        self
    }

    /// Add a readiness check.
    pub fn with_readiness_check(mut self, check: ReadinessCheck) -> Self {
        self.readiness_checks.push(check);
        self
    }

    /// Set the kill selection policy.
    pub fn with_kill_selection(mut self, selection: KillSelection) -> Self {
        self.kill_selection = selection;
        self
    }

    /// Check whether any health checks are declared.
    pub fn has_health_checks(&self) -> bool {
        !self.health_checks.is_empty()
    }

    /// Check whether any readiness checks are declared.
    pub fn has_readiness_checks(&self) -> bool {
        !self.readiness_checks.is_empty()
    }
}

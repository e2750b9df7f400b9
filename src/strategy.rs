//! Ignition strategy: the initial kill batch and the capacity ceiling for a
//! rolling upgrade.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::RunSpec;

/// Initial kill batch plus working capacity ceiling for a rolling upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartStrategy {
    /// Instances of the old version to kill before anything else happens.
    pub nr_to_kill_immediately: usize,
    /// Ceiling on concurrently existing instances during the upgrade.
    pub max_capacity: usize,
}

impl RestartStrategy {
    /// Compute the ignition strategy for `run_spec` given the current number
    /// of running instances.
    ///
    /// `min_healthy = ceil(target * minimum_health_capacity)` instances must
    /// survive the initial batch, and at most
    /// `max_capacity = floor(target * (1 + maximum_over_capacity))` instances
    /// may exist at once. The tight corner where `min_healthy == max_capacity
    /// <= running` would make a pure upgrade impossible; it is resolved by
    /// dropping one instance below the healthy floor for resident apps, or by
    /// granting one transient extra capacity slot otherwise.
    pub fn compute(run_spec: &RunSpec, running_count: usize) -> Self {
        assert!(
            run_spec.target_instances > 0,
            "run spec must target at least one instance"
        );

        let target = f64::from(run_spec.target_instances);
        let policy = &run_spec.upgrade_strategy;
        let min_healthy = (target * policy.minimum_health_capacity).ceil() as usize;
        let mut max_capacity = (target * (1.0 + policy.maximum_over_capacity)).floor() as usize;
        let mut nr_to_kill_immediately = running_count.saturating_sub(min_healthy);

        if min_healthy == max_capacity && max_capacity <= running_count {
            if run_spec.is_resident {
                // Resident instances must not over-provision; go one below
                // the healthy floor instead. If this kill is lost it is not
                // reissued.
                nr_to_kill_immediately = running_count - min_healthy + 1;
                info!(
                    app = %run_spec.id,
                    min_healthy,
                    nr_to_kill_immediately,
                    "tight capacity on resident run spec, killing one instance below the healthy floor"
                );
            } else {
                max_capacity += 1;
                info!(
                    app = %run_spec.id,
                    max_capacity,
                    "tight capacity, granting one transient extra instance"
                );
            }
        }

        assert!(max_capacity > 0, "max capacity must admit at least one instance");
        assert!(
            min_healthy < max_capacity
                || running_count - nr_to_kill_immediately < max_capacity,
            "restart strategy must leave headroom to launch a replacement"
        );

        Self {
            nr_to_kill_immediately,
            max_capacity,
        }
    }
}

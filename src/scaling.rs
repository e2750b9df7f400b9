//! Scaling proposition: which instances to kill and how many to start when a
//! run spec is scaled or partially decommissioned.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::app::KillSelection;
use crate::instance::{Condition, Instance, InstanceId};

/// Result of one scaling pass: instances to terminate and instances to
/// launch.
#[derive(Debug, Clone, Default)]
pub struct ScalingProposition {
    /// Instances to kill, most urgent first. `None` when nothing must die.
    pub to_kill: Option<Vec<Instance>>,
    /// Number of instances to launch. `None` when nothing must start.
    pub to_start: Option<usize>,
}

impl ScalingProposition {
    /// Decide which instances to kill and how many to start to reach
    /// `scale_to`.
    ///
    /// Goal-running members of `forced_decommission` are always sentenced
    /// first, then whatever the host-constraint resolver `meet_constraints`
    /// picks from the remaining candidates, then the rest ordered by
    /// [`sort_by_condition_and_date`]. Instances already in condition
    /// `Killing` count against the number that must go.
    pub fn propose<F>(
        instances: &[Instance],
        forced_decommission: &BTreeSet<InstanceId>,
        meet_constraints: F,
        scale_to: usize,
        kill_selection: KillSelection,
    ) -> Self
    where
        F: FnOnce(&[Instance], usize) -> Vec<Instance>,
    {
        let goal_running: Vec<Instance> = instances
            .iter()
            .filter(|instance| instance.is_goal_running())
            .cloned()
            .collect();
        let killing_count = instances
            .iter()
            .filter(|instance| instance.state.condition == Condition::Killing)
            .count();

        let (sentenced, free): (Vec<Instance>, Vec<Instance>) = goal_running
            .iter()
            .cloned()
            .partition(|instance| forced_decommission.contains(&instance.id));

        let decommission_count = (goal_running.len() as i64
            - killing_count as i64
            - scale_to as i64)
            .max(sentenced.len() as i64) as usize;

        let constraint_need = decommission_count.saturating_sub(sentenced.len());
        let constraint_kills = meet_constraints(&free, constraint_need);
        let constrained: BTreeSet<InstanceId> = constraint_kills
            .iter()
            .map(|instance| instance.id.clone())
            .collect();

        let mut rest: Vec<Instance> = free
            .iter()
            .filter(|instance| !constrained.contains(&instance.id))
            .cloned()
            .collect();
        rest.sort_by(|a, b| sort_by_condition_and_date(a, b, kill_selection));

        let mut candidates = sentenced;
        candidates.extend(constraint_kills);
        candidates.extend(rest);
        candidates.truncate(decommission_count);

        let to_start =
            scale_to as i64 - goal_running.len() as i64 + decommission_count as i64;

        Self {
            to_kill: if candidates.is_empty() {
                None
            } else {
                Some(candidates)
            },
            to_start: if to_start > 0 {
                Some(to_start as usize)
            } else {
                None
            },
        }
    }
}

/// Total, deterministic kill-priority ordering.
///
/// Ascending condition weight: unreachable before staging before starting
/// before running before everything else. Ties break on a condition-specific
/// timestamp with `selection` choosing the direction, then on instance id so
/// equal keys still sort stably.
pub fn sort_by_condition_and_date(
    a: &Instance,
    b: &Instance,
    selection: KillSelection,
) -> Ordering {
    condition_weight(a.state.condition)
        .cmp(&condition_weight(b.state.condition))
        .then_with(|| compare_timestamps(kill_timestamp(a), kill_timestamp(b), selection))
        .then_with(|| a.id.cmp(&b.id))
}

fn condition_weight(condition: Condition) -> u8 {
    match condition {
        Condition::Unreachable => 1,
        Condition::Staging => 2,
        Condition::Starting => 3,
        Condition::Running => 4,
        _ => 5,
    }
}

/// Timestamp used to order two instances of the same condition weight:
/// staging instances by their latest task staging time, starting instances
/// by when they entered the condition, everything else by when they became
/// active.
fn kill_timestamp(instance: &Instance) -> Option<DateTime<Utc>> {
    match instance.state.condition {
        Condition::Staging => instance.latest_staged_at(),
        Condition::Starting => Some(instance.state.since),
        _ => instance.state.active_since,
    }
}

fn compare_timestamps(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
    selection: KillSelection,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match selection {
            KillSelection::YoungestFirst => b.cmp(&a),
            KillSelection::OldestFirst => a.cmp(&b),
        },
        // A missing timestamp compares equal; the caller's id fallback keeps
        // the overall ordering deterministic.
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::app::{AppId, RunSpecVersion};
    use crate::instance::Goal;
    use crate::test_support::instance;

    fn no_constraints(_free: &[Instance], _need: usize) -> Vec<Instance> {
        Vec::new()
    }

    fn ids(proposition: &ScalingProposition) -> Vec<&str> {
        proposition
            .to_kill
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|instance| instance.id.as_str())
            .collect()
    }

    #[test]
    fn unreachable_dies_first_then_staging_by_selection() {
        let app = AppId::new("/web");
        let version = RunSpecVersion::now();
        let now = Utc::now();

        let unreachable = instance("a-unreachable", &app, version, Condition::Unreachable);
        let mut staging_old = instance("b-staging-old", &app, version, Condition::Staging);
        for task in staging_old.tasks.values_mut() {
            task.staged_at = now - Duration::minutes(10);
        }
        let mut staging_new = instance("c-staging-new", &app, version, Condition::Staging);
        for task in staging_new.tasks.values_mut() {
            task.staged_at = now - Duration::minutes(1);
        }
        let running_a = instance("d-running", &app, version, Condition::Running);
        let running_b = instance("e-running", &app, version, Condition::Running);

        let all = vec![
            running_a,
            staging_old,
            unreachable,
            staging_new,
            running_b,
        ];

        let youngest = ScalingProposition::propose(
            &all,
            &BTreeSet::new(),
            no_constraints,
            2,
            KillSelection::YoungestFirst,
        );
        assert_eq!(
            ids(&youngest),
            vec!["a-unreachable", "c-staging-new", "b-staging-old"]
        );
        assert_eq!(youngest.to_start, None);

        let oldest = ScalingProposition::propose(
            &all,
            &BTreeSet::new(),
            no_constraints,
            2,
            KillSelection::OldestFirst,
        );
        assert_eq!(
            ids(&oldest),
            vec!["a-unreachable", "b-staging-old", "c-staging-new"]
        );
    }

    #[test]
    fn forced_decommission_is_always_sentenced_first() {
        let app = AppId::new("/web");
        let version = RunSpecVersion::now();
        let all: Vec<Instance> = (0..3)
            .map(|n| instance(&format!("i-{n}"), &app, version, Condition::Running))
            .collect();
        let forced: BTreeSet<InstanceId> = [all[2].id.clone()].into();

        // Scale target is already met, so only the sentenced instance dies
        // and one replacement starts.
        let proposition =
            ScalingProposition::propose(&all, &forced, no_constraints, 3, KillSelection::YoungestFirst);
        assert_eq!(ids(&proposition), vec!["i-2"]);
        assert_eq!(proposition.to_start, Some(1));
    }

    #[test]
    fn constraint_kills_come_before_the_sorted_rest() {
        let app = AppId::new("/web");
        let version = RunSpecVersion::now();
        let all: Vec<Instance> = (0..4)
            .map(|n| instance(&format!("i-{n}"), &app, version, Condition::Running))
            .collect();
        let constrained = all[3].clone();

        let proposition = ScalingProposition::propose(
            &all,
            &BTreeSet::new(),
            move |_free, need| {
                assert_eq!(need, 2);
                vec![constrained]
            },
            2,
            KillSelection::OldestFirst,
        );
        let killed = ids(&proposition);
        assert_eq!(killed.len(), 2);
        assert_eq!(killed[0], "i-3");
    }

    #[test]
    fn instances_already_killing_reduce_the_kill_count() {
        let app = AppId::new("/web");
        let version = RunSpecVersion::now();
        let mut all: Vec<Instance> = (0..3)
            .map(|n| instance(&format!("i-{n}"), &app, version, Condition::Running))
            .collect();
        let mut dying = instance("i-dying", &app, version, Condition::Killing);
        dying.state.goal = Goal::Stopped;
        all.push(dying);

        let proposition = ScalingProposition::propose(
            &all,
            &BTreeSet::new(),
            no_constraints,
            2,
            KillSelection::YoungestFirst,
        );
        assert!(proposition.to_kill.is_none());
        assert!(proposition.to_start.is_none());
    }

    #[test]
    fn scaling_up_only_starts_instances() {
        let app = AppId::new("/web");
        let version = RunSpecVersion::now();
        let all: Vec<Instance> = (0..2)
            .map(|n| instance(&format!("i-{n}"), &app, version, Condition::Running))
            .collect();

        let proposition = ScalingProposition::propose(
            &all,
            &BTreeSet::new(),
            no_constraints,
            4,
            KillSelection::YoungestFirst,
        );
        assert!(proposition.to_kill.is_none());
        assert_eq!(proposition.to_start, Some(2));
    }
}

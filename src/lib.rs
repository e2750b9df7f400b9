//! Rolling-replacement controller for the Conifer orchestrator.
//!
//! This crate drives every running instance of an app from an old run-spec
//! version to a new one while continuously respecting the app's upgrade
//! policy (minimum healthy capacity, maximum over-capacity), health checks,
//! and optional readiness checks.
//!
//! # Architecture
//!
//! - [`RestartStrategy`]: pure ignition calculator deciding the initial kill
//!   batch and the working capacity ceiling for an upgrade.
//! - [`ScalingProposition`]: pure scaling algorithm deciding which instances
//!   to kill and how many to start when a run spec is scaled or
//!   decommissioned.
//! - [`ReadinessSubscriptions`]: registry of running readiness streams and
//!   their cancellation handles.
//! - [`ReplacementController`]: the four-phase event-driven state machine
//!   coordinating kills, launches, and readiness against the capacity
//!   invariant.
//!
//! The controller is a single-consumer task fed by the instance event bus and
//! by its own background I/O. Its collaborators (instance tracker, kill
//! service, launch queue, readiness executor) are trait objects, so embedders
//! plug in the real cluster services and tests plug in the in-memory doubles
//! from [`test_support`].

#![warn(missing_docs)]

mod app;
mod controller;
mod deps;
mod error;
mod events;
mod instance;
mod readiness;
mod scaling;
mod strategy;
pub mod test_support;

pub use app::{
    AppId, HealthCheck, KillSelection, ReadinessCheck, RunSpec, RunSpecVersion, UpgradeStrategy,
};
pub use controller::{DeploymentStatus, ReadinessCheckUpdate, ReplacementController};
pub use deps::{InstanceTracker, KillReason, KillService, LaunchQueue};
pub use error::{CollaboratorError, ReplacementError, Result};
pub use events::{
    InstanceChanged, InstanceEvent, InstanceEventBus, InstanceHealthChanged,
    DEFAULT_EVENT_BUS_CAPACITY,
};
pub use instance::{Condition, Goal, Instance, InstanceId, InstanceState, Task, TaskId};
pub use readiness::{
    ReadinessCheckExecutor, ReadinessCheckResult, ReadinessCheckSpec, ReadinessKey,
    ReadinessProbe, ReadinessSubscriptions,
};
pub use scaling::{sort_by_condition_and_date, ScalingProposition};
pub use strategy::RestartStrategy;

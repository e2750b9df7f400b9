//! Instance lifecycle and health events, and the in-process event bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::app::{AppId, RunSpecVersion};
use crate::instance::{Condition, Instance, InstanceId};

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;

/// An instance was created, changed condition, or was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceChanged {
    /// Instance that changed.
    pub id: InstanceId,
    /// Version of the run spec the instance belongs to.
    pub run_spec_version: RunSpecVersion,
    /// Condition after the change.
    pub condition: Condition,
    /// Full instance snapshot after the change.
    pub instance: Instance,
}

impl InstanceChanged {
    /// Build the event from an instance snapshot.
    pub fn new(instance: Instance) -> Self {
        Self {
            id: instance.id.clone(),
            run_spec_version: instance.run_spec_version,
            condition: instance.state.condition,
            instance,
        }
    }
}

/// The aggregate health of an instance changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealthChanged {
    /// Instance whose health changed.
    pub id: InstanceId,
    /// Version of the run spec the instance belongs to.
    pub run_spec_version: RunSpecVersion,
    /// App the instance belongs to.
    pub path_id: AppId,
    /// New aggregate health; absent when unreported.
    pub healthy: Option<bool>,
}

/// Events published on the instance event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstanceEvent {
    /// Instance lifecycle change.
    Changed(InstanceChanged),
    /// Instance health change.
    HealthChanged(InstanceHealthChanged),
}

/// In-process fan-out bus for instance events.
///
/// Thin wrapper over a broadcast channel: every subscriber observes events in
/// publish order. A subscriber that falls behind the buffer observes a lag
/// error instead of silently missing events.
#[derive(Debug, Clone)]
pub struct InstanceEventBus {
    sender: broadcast::Sender<InstanceEvent>,
}

impl InstanceEventBus {
    /// Create a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUS_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: InstanceEvent) {
        // Send only errors when nobody is subscribed, which is not a problem
        // for a fan-out bus.
        let _ = self.sender.send(event);
    }
}

impl Default for InstanceEventBus {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::Mutex;

use stageflow_common::StageId;
use tracing::debug;

/// Posted after a stage's child plan was adaptively rewritten, right before
/// the stage executes.
#[derive(Debug, Clone)]
pub struct AdaptiveExecutionUpdate {
    /// Stage whose child plan changed.
    pub stage: StageId,
    /// Rendered current plan.
    pub plan_string: String,
}

/// Sink for adaptive-execution events.
pub trait EventBus: Send + Sync {
    /// Deliver one event.
    fn post(&self, event: AdaptiveExecutionUpdate);
}

/// Default bus logging events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn post(&self, event: AdaptiveExecutionUpdate) {
        debug!(stage = %event.stage, plan = %event.plan_string, "adaptive execution update");
    }
}

/// Bus retaining events in memory for inspection.
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<AdaptiveExecutionUpdate>>,
}

impl RecordingEventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events posted so far.
    pub fn events(&self) -> Vec<AdaptiveExecutionUpdate> {
        self.events.lock().expect("event bus lock poisoned").clone()
    }
}

impl EventBus for RecordingEventBus {
    fn post(&self, event: AdaptiveExecutionUpdate) {
        self.events
            .lock()
            .expect("event bus lock poisoned")
            .push(event);
    }
}

//! Backend contract consumed by the client and the task loop.
//!
//! A backend durably stores each instance's history and hands out workflow
//! tasks. Storage engines and dispatch loops live outside this crate; the
//! [`InMemoryBackend`] here is the reference implementation used by tests.

mod error;
mod in_memory;

pub use error::BackendError;
pub use in_memory::{ActivityTask, InMemoryBackend, TimerTask};

use crate::history::{HistoryEvent, WorkflowEvent, WorkflowInstance};
use crate::runtime::WorkflowState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Engine-wide counters reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub active_workflow_instances: usize,
    pub pending_activities: usize,
    pub pending_workflow_tasks: usize,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new instance. `start` must carry an `ExecutionStarted` event.
    async fn create_workflow_instance(&self, start: WorkflowEvent) -> Result<(), BackendError>;

    /// Deliver a `CancelRequested` event to a running instance.
    async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: HistoryEvent,
    ) -> Result<(), BackendError>;

    /// Deliver a `SignalReceived` event to the current execution of `instance_id`.
    async fn signal_workflow(&self, instance_id: &str, event: HistoryEvent) -> Result<(), BackendError>;

    /// Deliver an `ExecutionTerminated` event; no workflow code runs afterwards.
    async fn terminate_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: HistoryEvent,
    ) -> Result<(), BackendError>;

    async fn get_workflow_instance_state(&self, instance: &WorkflowInstance) -> Result<WorkflowState, BackendError>;

    /// Committed history in sequence order.
    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<HistoryEvent>, BackendError>;

    async fn get_stats(&self) -> Result<Stats, BackendError>;
}

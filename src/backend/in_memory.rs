use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Backend, BackendError, Stats};
use crate::commands::Command;
use crate::history::{EventKind, HistoryEvent, Payload, WorkflowEvent, WorkflowInstance};
use crate::runtime::{TaskResult, WorkflowState, WorkflowTask};

/// Activity waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTask {
    pub instance: WorkflowInstance,
    pub id: u64,
    pub name: String,
    pub inputs: Vec<Payload>,
}

/// Durable timer waiting to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTask {
    pub instance: WorkflowInstance,
    pub id: u64,
    pub fire_at_ms: u64,
}

#[derive(Debug)]
struct InstanceRecord {
    instance: WorkflowInstance,
    history: Vec<HistoryEvent>,
    /// Events waiting for the next workflow task.
    inbox: Vec<HistoryEvent>,
    /// Ids of inbox events handed out by an uncommitted task.
    in_flight: Option<HashSet<String>>,
    state: WorkflowState,
}

#[derive(Debug, Default)]
struct Inner {
    instances: BTreeMap<String, InstanceRecord>,
    activities: Vec<ActivityTask>,
    timers: Vec<TimerTask>,
}

impl Inner {
    fn record(&mut self, operation: &str, instance: &WorkflowInstance) -> Result<&mut InstanceRecord, BackendError> {
        match self.instances.get_mut(&instance.instance_id) {
            Some(r) if r.instance.execution_id == instance.execution_id => Ok(r),
            _ => Err(BackendError::permanent(operation, format!("instance not found: {instance}"))),
        }
    }

    fn running(&mut self, operation: &str, instance: &WorkflowInstance) -> Result<&mut InstanceRecord, BackendError> {
        let record = self.record(operation, instance)?;
        if record.state == WorkflowState::Finished {
            return Err(BackendError::permanent(operation, format!("instance already finished: {instance}")));
        }
        Ok(record)
    }
}

/// Reference backend keeping everything in process memory.
///
/// Besides the [`Backend`] contract it plays the worker's side for tests:
/// hand out tasks, commit results, complete activities and fire timers.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the first instance (by id) with undelivered events and return its task.
    pub async fn next_task(&self) -> Option<WorkflowTask> {
        let mut g = self.inner.lock().await;
        let record = g
            .instances
            .values_mut()
            .find(|r| r.state == WorkflowState::Running && r.in_flight.is_none() && !r.inbox.is_empty())?;
        record.in_flight = Some(record.inbox.iter().map(|e| e.id.clone()).collect());
        Some(WorkflowTask {
            instance: record.instance.clone(),
            history: record.history.clone(),
            new_events: record.inbox.clone(),
        })
    }

    /// Release a task without committing it; its events are delivered again.
    pub async fn abandon_task(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        g.record("abandon_task", instance)?.in_flight = None;
        Ok(())
    }

    /// Persist a task's events and dispatch its commands.
    pub async fn commit_task(&self, result: TaskResult) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let record = g.record("commit_task", &result.instance)?;
        let Some(delivered) = record.in_flight.take() else {
            return Err(BackendError::permanent(
                "commit_task",
                format!("no task in flight for {}", result.instance),
            ));
        };
        let mut next = record.history.len() as u64 + 1;
        for event in &result.new_events {
            if event.sequence_id != next {
                record.in_flight = Some(delivered);
                return Err(BackendError::permanent(
                    "commit_task",
                    format!("event sequence {} does not follow {}", event.sequence_id, next - 1),
                ));
            }
            next += 1;
        }
        record.history.extend(result.new_events.iter().cloned());
        record.inbox.retain(|e| !delivered.contains(&e.id));
        record.state = result.state;
        let instance = record.instance.clone();

        for command in result.commands {
            match command {
                Command::ScheduleActivity { id, name, inputs } => g.activities.push(ActivityTask {
                    instance: instance.clone(),
                    id,
                    name,
                    inputs,
                }),
                Command::ScheduleTimer { id, fire_at_ms } => g.timers.push(TimerTask {
                    instance: instance.clone(),
                    id,
                    fire_at_ms,
                }),
                Command::WaitSignal { .. } | Command::CompleteInstance { .. } | Command::CancelInstance { .. } => {}
            }
        }
        if result.state == WorkflowState::Finished {
            g.activities.retain(|a| a.instance != instance);
            g.timers.retain(|t| t.instance != instance);
        }
        debug!(instance_id = %instance.instance_id, events = result.new_events.len(), state = ?result.state, "task committed");
        Ok(())
    }

    pub async fn pending_activities(&self) -> Vec<ActivityTask> {
        self.inner.lock().await.activities.clone()
    }

    pub async fn pending_timers(&self) -> Vec<TimerTask> {
        self.inner.lock().await.timers.clone()
    }

    pub async fn complete_activity(&self, task: &ActivityTask, result: Payload) -> Result<(), BackendError> {
        self.finish_activity("complete_activity", task, EventKind::ActivityCompleted { result })
            .await
    }

    pub async fn fail_activity(&self, task: &ActivityTask, error: impl Into<String>) -> Result<(), BackendError> {
        self.finish_activity("fail_activity", task, EventKind::ActivityFailed { error: error.into() })
            .await
    }

    async fn finish_activity(&self, operation: &str, task: &ActivityTask, kind: EventKind) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let before = g.activities.len();
        g.activities.retain(|a| !(a.instance == task.instance && a.id == task.id));
        if g.activities.len() == before {
            return Err(BackendError::permanent(operation, format!("no pending activity {}", task.id)));
        }
        let timestamp = g
            .record(operation, &task.instance)?
            .history
            .last()
            .map(|e| e.timestamp_ms)
            .unwrap_or(0);
        let event = HistoryEvent::new(timestamp, kind).with_schedule_event_id(task.id);
        g.running(operation, &task.instance)?.inbox.push(event);
        Ok(())
    }

    /// Fire a pending timer. The event is stamped with the timer's due time.
    pub async fn fire_timer(&self, timer: &TimerTask) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let before = g.timers.len();
        g.timers.retain(|t| !(t.instance == timer.instance && t.id == timer.id));
        if g.timers.len() == before {
            return Err(BackendError::permanent("fire_timer", format!("no pending timer {}", timer.id)));
        }
        let event = HistoryEvent::new(
            timer.fire_at_ms,
            EventKind::TimerFired {
                fire_at_ms: timer.fire_at_ms,
            },
        )
        .with_schedule_event_id(timer.id);
        g.running("fire_timer", &timer.instance)?.inbox.push(event);
        Ok(())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create_workflow_instance(&self, start: WorkflowEvent) -> Result<(), BackendError> {
        if !matches!(start.event.kind, EventKind::ExecutionStarted { .. }) {
            return Err(BackendError::permanent(
                "create_workflow_instance",
                format!("expected ExecutionStarted, got {}", start.event.kind.type_name()),
            ));
        }
        let mut g = self.inner.lock().await;
        if g.instances.contains_key(&start.instance.instance_id) {
            return Err(BackendError::permanent(
                "create_workflow_instance",
                format!("instance already exists: {}", start.instance.instance_id),
            ));
        }
        g.instances.insert(
            start.instance.instance_id.clone(),
            InstanceRecord {
                instance: start.instance,
                history: Vec::new(),
                inbox: vec![start.event],
                in_flight: None,
                state: WorkflowState::Running,
            },
        );
        Ok(())
    }

    async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        g.running("cancel_workflow_instance", instance)?.inbox.push(event);
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, event: HistoryEvent) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        let instance = match g.instances.get(instance_id) {
            Some(r) => r.instance.clone(),
            None => {
                return Err(BackendError::permanent(
                    "signal_workflow",
                    format!("instance not found: {instance_id}"),
                ));
            }
        };
        g.running("signal_workflow", &instance)?.inbox.push(event);
        Ok(())
    }

    async fn terminate_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        event: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut g = self.inner.lock().await;
        g.running("terminate_workflow_instance", instance)?.inbox.push(event);
        Ok(())
    }

    async fn get_workflow_instance_state(&self, instance: &WorkflowInstance) -> Result<WorkflowState, BackendError> {
        let mut g = self.inner.lock().await;
        Ok(g.record("get_workflow_instance_state", instance)?.state)
    }

    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<HistoryEvent>, BackendError> {
        let mut g = self.inner.lock().await;
        Ok(g.record("get_workflow_instance_history", instance)?.history.clone())
    }

    async fn get_stats(&self) -> Result<Stats, BackendError> {
        let g = self.inner.lock().await;
        let running: Vec<&InstanceRecord> = g
            .instances
            .values()
            .filter(|r| r.state == WorkflowState::Running)
            .collect();
        Ok(Stats {
            active_workflow_instances: running.len(),
            pending_activities: g.activities.len(),
            pending_workflow_tasks: running.iter().filter(|r| !r.inbox.is_empty()).count(),
        })
    }
}

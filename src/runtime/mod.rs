//! Task execution loop.
//!
//! A [`TaskExecutor`] takes one [`WorkflowTask`] (instance, committed history,
//! new events), advances the instance's scheduler and returns the events to
//! persist plus the commands to dispatch. It performs no I/O, so the backend
//! may redeliver a task freely: already-seen events are dropped and finished
//! instances produce nothing.

mod cache;
pub mod observability;
pub mod registry;
pub(crate) mod replay_engine;

use crate::clock::{Clock, SystemClock};
use crate::codec::{Converter, JsonConverter};
use crate::commands::Command;
use crate::errors::EngineError;
use crate::history::{EventKind, HistoryEvent, HistoryLog, WorkflowInstance};
use cache::ExecutorCache;
use observability::{Metrics, MetricsSnapshot};
use registry::WorkflowRegistry;
use replay_engine::{ReplayEngine, Replayed};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine configuration. Clock and converter are injected here and nowhere else.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Timestamps for events the engine creates.
    pub clock: Arc<dyn Clock>,
    /// Payload serialization strategy.
    pub converter: Arc<dyn Converter>,
    /// Number of live schedulers kept between tasks. `0` disables caching.
    /// Default: 128
    pub cache_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            converter: Arc::new(JsonConverter),
            cache_capacity: 128,
        }
    }
}

impl EngineOptions {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }
}

/// Whether an instance can still make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Running,
    Finished,
}

/// Unit of work handed to the executor by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowTask {
    pub instance: WorkflowInstance,
    /// Committed history, sequence ids contiguous from 1.
    pub history: Vec<HistoryEvent>,
    /// Events not yet part of history.
    pub new_events: Vec<HistoryEvent>,
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub instance: WorkflowInstance,
    /// Sequenced events to append to history.
    pub new_events: Vec<HistoryEvent>,
    /// Commands to dispatch, in emission order.
    pub commands: Vec<Command>,
    pub state: WorkflowState,
}

impl TaskResult {
    fn empty(instance: WorkflowInstance, state: WorkflowState) -> Self {
        Self {
            instance,
            new_events: Vec::new(),
            commands: Vec::new(),
            state,
        }
    }
}

/// Result of [`TaskExecutor::replay_history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub events_replayed: usize,
    pub state: WorkflowState,
    /// Terminal event of the history, if it has one.
    pub terminal: Option<EventKind>,
    /// Commands re-issued because the history records inputs only.
    pub commands: Vec<Command>,
}

/// Runs workflow tasks against a registry.
pub struct TaskExecutor {
    registry: WorkflowRegistry,
    options: EngineOptions,
    cache: ExecutorCache<ReplayEngine>,
    metrics: Metrics,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(registry: WorkflowRegistry, options: EngineOptions) -> Self {
        let cache = ExecutorCache::new(options.cache_capacity);
        Self {
            registry,
            options,
            cache,
            metrics: Metrics::default(),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn new_engine(&self, instance: &WorkflowInstance) -> ReplayEngine {
        ReplayEngine::new(
            instance.clone(),
            self.registry.clone(),
            Arc::clone(&self.options.converter),
            Arc::clone(&self.options.clock),
        )
    }

    /// Advance one instance by one task.
    ///
    /// Any error aborts the attempt without side effects; the same task may
    /// be retried.
    pub fn execute(&self, task: WorkflowTask) -> Result<TaskResult, EngineError> {
        let span = tracing::debug_span!(
            "workflow_task",
            instance_id = %task.instance.instance_id,
            execution_id = %task.instance.execution_id,
        );
        let _enter = span.enter();
        let instance_id = task.instance.instance_id.clone();

        match self.execute_inner(task) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.cache.remove(&instance_id);
                self.metrics.record_failure(err.is_nondeterminism());
                warn!(instance_id = %instance_id, error = %err, "workflow task failed");
                Err(err)
            }
        }
    }

    fn execute_inner(&self, task: WorkflowTask) -> Result<TaskResult, EngineError> {
        let WorkflowTask {
            instance,
            history,
            new_events,
        } = task;

        let mut seen: HashSet<String> = history.iter().map(|e| e.id.clone()).collect();
        let total = new_events.len();
        let fresh: Vec<HistoryEvent> = new_events.into_iter().filter(|e| seen.insert(e.id.clone())).collect();
        let dropped = total - fresh.len();
        if dropped > 0 {
            warn!(instance_id = %instance.instance_id, dropped, "dropping redelivered events");
        }

        if history.iter().any(|e| e.kind.is_terminal()) {
            debug!(instance_id = %instance.instance_id, "instance already finished");
            self.cache.remove(&instance.instance_id);
            self.metrics.record_duplicates(dropped + fresh.len());
            return Ok(TaskResult::empty(instance, WorkflowState::Finished));
        }
        self.metrics.record_duplicates(dropped);
        if fresh.is_empty() {
            return Ok(TaskResult::empty(instance, WorkflowState::Running));
        }

        if let Some(terminated) = fresh
            .iter()
            .find(|e| matches!(e.kind, EventKind::ExecutionTerminated { .. }))
        {
            let mut log = HistoryLog::from_events(history)?;
            let start = log.last_sequence_id() + 1;
            // A first task keeps its start event so the history stays replayable.
            if log.is_empty() {
                if let Some(begun) = fresh
                    .iter()
                    .find(|e| matches!(e.kind, EventKind::ExecutionStarted { .. }))
                {
                    log.append(begun.clone().with_sequence_id(0))?;
                }
            }
            let appended = log.append(terminated.clone().with_sequence_id(0))?.sequence_id;
            let new_events = log.read(start).to_vec();
            self.cache.remove(&instance.instance_id);
            debug!(instance_id = %instance.instance_id, sequence_id = appended, "instance terminated");
            self.metrics.record_task(0, new_events.len(), 0);
            return Ok(TaskResult {
                instance,
                new_events,
                commands: Vec::new(),
                state: WorkflowState::Finished,
            });
        }

        let cached = self.cache.take(&instance.instance_id);
        let (mut engine, replayed) = match cached {
            Some(engine) if engine.instance() == &instance && engine.history().events() == history.as_slice() => {
                self.metrics.record_cache(true);
                debug!(instance_id = %instance.instance_id, "resuming cached scheduler");
                (engine, Replayed::default())
            }
            _ => {
                self.metrics.record_cache(false);
                let mut engine = self.new_engine(&instance);
                let replayed = engine.replay(history)?;
                (engine, replayed)
            }
        };

        let mut applied = replayed.reissued;
        let fresh_applied = engine.apply_new_events(fresh)?;
        applied.events.extend(fresh_applied.events);
        applied.commands.extend(fresh_applied.commands);
        applied.duplicates += fresh_applied.duplicates;
        let replayed = replayed.events;
        let state = if engine.is_finished() {
            WorkflowState::Finished
        } else {
            WorkflowState::Running
        };
        self.metrics.record_duplicates(applied.duplicates);
        self.metrics
            .record_task(replayed, applied.events.len(), applied.commands.len());
        debug!(
            instance_id = %instance.instance_id,
            replayed,
            appended = applied.events.len(),
            commands = applied.commands.len(),
            ?state,
            "workflow task executed"
        );

        if state == WorkflowState::Running {
            self.cache.insert(instance.instance_id.clone(), engine);
        }
        Ok(TaskResult {
            instance,
            new_events: applied.events,
            commands: applied.commands,
            state,
        })
    }

    /// Replay a complete history, terminal event included, and report how it
    /// ends. A history that records only inputs has its commands re-issued
    /// and reported instead. Fails with the non-determinism fault if the current workflow code
    /// no longer produces that history.
    pub fn replay_history(
        &self,
        instance: &WorkflowInstance,
        history: Vec<HistoryEvent>,
    ) -> Result<ReplayReport, EngineError> {
        let mut engine = self.new_engine(instance);
        let replayed = engine.replay(history)?;
        let terminal = engine
            .history()
            .events()
            .iter()
            .rev()
            .find(|e| e.kind.is_terminal())
            .map(|e| e.kind.clone());
        let state = if engine.is_finished() {
            WorkflowState::Finished
        } else {
            WorkflowState::Running
        };
        Ok(ReplayReport {
            events_replayed: replayed.events,
            state,
            terminal,
            commands: replayed.reissued.commands,
        })
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

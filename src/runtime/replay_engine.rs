//! Deterministic scheduler.
//!
//! The engine drives workflow code with a no-op waker and treats every
//! decision it makes as an emitted action. History is consumed in order:
//!
//! - a `WorkflowTaskStarted` marker opens each task's batch;
//! - *input* events (start, completions, signals, cancel requests) are
//!   delivered to the workflow without running it;
//! - *command* events are the recorded consequences of the drive that
//!   followed a batch and must match the emitted actions one-for-one.
//!
//! Workflow code only runs once a whole batch is delivered, so the order in
//! which completions arrived inside one task never leaks into its decisions.
//! Logical time only moves forward: it is the latest timestamp delivered so
//! far. During replay a drive happens lazily, at the first command or marker
//! after a batch. Past the end of recorded history each drive's actions are
//! committed immediately as new command events, which is exactly the shape
//! replay later expects. Any divergence is a non-determinism fault.
//!
//! A completion may arrive in the same batch as the drive that schedules it.
//! It is held back until its schedule is committed and settled right then.
//! A history holding nothing but input events is replayed the same way: the
//! scheduling commands are re-issued as new events before the completions
//! are consumed.

use crate::commands::{Action, Command, EmittedAction};
use crate::errors::{EngineError, WorkflowError};
use crate::history::{EventClass, EventKind, HistoryEvent, HistoryLog, Payload, WorkflowInstance};
use crate::runtime::panic_message;
use crate::runtime::registry::WorkflowRegistry;
use crate::{Clock, Converter, PendingKind, Unit, WorkflowContext};
use ::futures::FutureExt;
use ::futures::task::noop_waker_ref;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

type RootFuture = Pin<Box<dyn Future<Output = Result<Payload, WorkflowError>> + Send>>;

/// Events a live step appended, and the commands they produced.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub(crate) events: Vec<HistoryEvent>,
    pub(crate) commands: Vec<Command>,
    pub(crate) duplicates: usize,
}

/// Outcome of [`ReplayEngine::replay`].
#[derive(Debug, Default)]
pub(crate) struct Replayed {
    pub(crate) events: usize,
    /// Commands re-issued for a history that records inputs only.
    pub(crate) reissued: Applied,
}

pub(crate) struct ReplayEngine {
    instance: WorkflowInstance,
    log: HistoryLog,
    ctx: WorkflowContext,
    registry: WorkflowRegistry,
    clock: Arc<dyn Clock>,
    root: Option<RootFuture>,
    /// Spawned sub-units in creation order; `None` once finished.
    units: Vec<Option<Unit>>,
    started: bool,
    /// The root returned; its terminal action is queued or recorded.
    root_done: bool,
    /// A terminal event is part of the log.
    finished: bool,
    /// Something was delivered since the last drive.
    must_drive: bool,
    /// Correlation ids whose schedule is recorded, with what they wait for.
    committed: BTreeMap<u64, PendingKind>,
    resolved: BTreeSet<u64>,
    /// Completions delivered ahead of their schedule.
    deferred: BTreeMap<u64, HistoryEvent>,
    signal_waiters: BTreeMap<String, VecDeque<u64>>,
    signal_buffer: BTreeMap<String, VecDeque<Option<Payload>>>,
}

impl ReplayEngine {
    pub(crate) fn new(
        instance: WorkflowInstance,
        registry: WorkflowRegistry,
        converter: Arc<dyn Converter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ctx = WorkflowContext::new(instance.clone(), converter);
        Self {
            instance,
            log: HistoryLog::new(),
            ctx,
            registry,
            clock,
            root: None,
            units: Vec::new(),
            started: false,
            root_done: false,
            finished: false,
            must_drive: false,
            committed: BTreeMap::new(),
            resolved: BTreeSet::new(),
            deferred: BTreeMap::new(),
            signal_waiters: BTreeMap::new(),
            signal_buffer: BTreeMap::new(),
        }
    }

    pub(crate) fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub(crate) fn history(&self) -> &HistoryLog {
        &self.log
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Rebuild state from committed history.
    pub(crate) fn replay(&mut self, history: Vec<HistoryEvent>) -> Result<Replayed, EngineError> {
        let history = HistoryLog::from_events(history)?;
        let first_input = history.events().iter().find(|e| e.kind.class() != EventClass::Marker);
        if let Some(first) = first_input {
            if !matches!(first.kind, EventKind::ExecutionStarted { .. }) {
                return Err(EngineError::CorruptedHistory(format!(
                    "history starts with {} instead of ExecutionStarted",
                    first.kind.type_name()
                )));
            }
        }

        let count = history.len();
        let inputs_only = history
            .events()
            .iter()
            .all(|e| matches!(e.kind.class(), EventClass::Input | EventClass::Termination));
        self.ctx.state().replaying = count > 0;
        for event in history.into_events() {
            self.replay_event(&event)?;
            self.log.append(event)?;
        }
        let reissued = if inputs_only && count > 0 {
            self.reissue()?
        } else {
            self.finish_replay()?;
            Applied::default()
        };
        debug!(
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            events = count,
            reissued = reissued.commands.len(),
            "history replayed"
        );
        Ok(Replayed { events: count, reissued })
    }

    /// Commit what the workflow decides about an input-only history.
    fn reissue(&mut self) -> Result<Applied, EngineError> {
        let start = self.log.last_sequence_id() + 1;
        self.ctx.state().replaying = false;
        let mut applied = Applied::default();
        self.run_live(&mut applied.commands)?;
        self.expect_no_deferred()?;
        applied.events = self.log.read(start).to_vec();
        Ok(applied)
    }

    fn replay_event(&mut self, event: &HistoryEvent) -> Result<(), EngineError> {
        if self.finished {
            return Err(EngineError::CorruptedHistory(format!(
                "{} at sequence {} follows a terminal event",
                event.kind.type_name(),
                event.sequence_id
            )));
        }
        match event.kind.class() {
            EventClass::Marker => {
                self.drive_if_idle();
                self.expect_no_leftover(event)?;
                self.expect_no_deferred()?;
            }
            EventClass::Input => {
                self.expect_no_leftover(event)?;
                self.deliver(event, false)?;
            }
            EventClass::Command => {
                self.drive_if_idle();
                let next = self.ctx.state().emitted.pop_front();
                let Some(action) = next else {
                    return Err(self.nondeterminism(format!(
                        "history records {} at sequence {} but the workflow did not emit it",
                        event.kind.type_name(),
                        event.sequence_id
                    )));
                };
                if let Some(mismatch) = action.mismatch(event) {
                    return Err(self.nondeterminism(mismatch));
                }
                debug!(
                    instance_id = %self.instance.instance_id,
                    sequence_id = event.sequence_id,
                    schedule_event_id = ?event.schedule_event_id,
                    kind = event.kind.type_name(),
                    "replayed command matched"
                );
                self.record_commit(&action)?;
            }
            EventClass::Termination => self.finished = true,
        }
        Ok(())
    }

    /// Actions still queued when the next batch begins were never recorded.
    fn expect_no_leftover(&self, event: &HistoryEvent) -> Result<(), EngineError> {
        let leftover = self.ctx.state().emitted.front().cloned();
        match leftover {
            Some(action) => Err(self.nondeterminism(format!(
                "workflow emitted {} which history does not record before {} at sequence {}",
                action.to_event_kind().type_name(),
                event.kind.type_name(),
                event.sequence_id
            ))),
            None => Ok(()),
        }
    }

    /// Held-back completions whose schedule never showed up.
    fn expect_no_deferred(&self) -> Result<(), EngineError> {
        match self.deferred.iter().next() {
            Some((id, event)) => Err(self.nondeterminism(format!(
                "{} at sequence {} refers to correlation id {id} which was never scheduled",
                event.kind.type_name(),
                event.sequence_id
            ))),
            None => Ok(()),
        }
    }

    fn finish_replay(&mut self) -> Result<(), EngineError> {
        if !self.finished {
            self.drive_if_idle();
        }
        let leftover = self.ctx.state().emitted.front().cloned();
        if let Some(action) = leftover {
            return Err(self.nondeterminism(format!(
                "workflow emitted {} past the end of recorded history",
                action.to_event_kind().type_name()
            )));
        }
        self.expect_no_deferred()?;
        self.ctx.state().replaying = false;
        Ok(())
    }

    /// Apply events that are not part of committed history yet.
    ///
    /// The accepted events form one batch: they are appended behind a
    /// `WorkflowTaskStarted` marker and delivered together, then the workflow
    /// runs until it blocks again.
    pub(crate) fn apply_new_events(&mut self, events: Vec<HistoryEvent>) -> Result<Applied, EngineError> {
        let start = self.log.last_sequence_id() + 1;
        let mut applied = Applied::default();
        let mut opened = false;
        for event in events {
            if self.finished {
                warn!(
                    instance_id = %self.instance.instance_id,
                    event_id = %event.id,
                    kind = event.kind.type_name(),
                    "dropping event delivered after the instance finished"
                );
                continue;
            }
            match event.kind.class() {
                EventClass::Input => {
                    if self.is_duplicate_completion(&event) {
                        warn!(
                            instance_id = %self.instance.instance_id,
                            event_id = %event.id,
                            schedule_event_id = ?event.schedule_event_id,
                            "dropping duplicate completion"
                        );
                        applied.duplicates += 1;
                        continue;
                    }
                    if !opened {
                        self.open_task()?;
                        opened = true;
                    }
                    let event = self.append(event.with_sequence_id(0))?;
                    self.deliver(&event, true)?;
                }
                EventClass::Termination => {
                    self.append(event.with_sequence_id(0))?;
                    self.finished = true;
                }
                EventClass::Command | EventClass::Marker => {
                    return Err(EngineError::CorruptedHistory(format!(
                        "{} delivered as a new event",
                        event.kind.type_name()
                    )));
                }
            }
        }
        self.run_live(&mut applied.commands)?;
        self.expect_no_deferred()?;
        applied.events = self.log.read(start).to_vec();
        Ok(applied)
    }

    fn open_task(&mut self) -> Result<(), EngineError> {
        let sequence_id = self.log.last_sequence_id() + 1;
        let marker = HistoryEvent::derived(
            &self.instance.execution_id,
            sequence_id,
            self.clock.now_ms(),
            EventKind::WorkflowTaskStarted,
        );
        self.log.append(marker)?;
        Ok(())
    }

    fn append(&mut self, event: HistoryEvent) -> Result<HistoryEvent, EngineError> {
        Ok(self.log.append(event)?.clone())
    }

    /// Drive until quiescent, committing every emitted action as it appears.
    fn run_live(&mut self, commands: &mut Vec<Command>) -> Result<(), EngineError> {
        while self.must_drive && !self.finished {
            self.must_drive = false;
            self.drive();
            loop {
                let next = self.ctx.state().emitted.pop_front();
                let Some(action) = next else { break };
                let sequence_id = self.log.last_sequence_id() + 1;
                let mut event = HistoryEvent::derived(
                    &self.instance.execution_id,
                    sequence_id,
                    self.clock.now_ms(),
                    action.to_event_kind(),
                );
                event.schedule_event_id = action.id;
                self.log.append(event)?;
                debug!(
                    instance_id = %self.instance.instance_id,
                    sequence_id,
                    schedule_event_id = ?action.id,
                    "committed new command"
                );
                commands.push(action.to_command());
                self.record_commit(&action)?;
            }
        }
        Ok(())
    }

    fn is_duplicate_completion(&self, event: &HistoryEvent) -> bool {
        let is_completion = matches!(
            event.kind,
            EventKind::ActivityCompleted { .. } | EventKind::ActivityFailed { .. } | EventKind::TimerFired { .. }
        );
        match event.schedule_event_id {
            Some(id) => is_completion && (self.resolved.contains(&id) || self.deferred.contains_key(&id)),
            None => false,
        }
    }

    /// Hand an input event to the workflow.
    fn deliver(&mut self, event: &HistoryEvent, live: bool) -> Result<(), EngineError> {
        let is_start = matches!(event.kind, EventKind::ExecutionStarted { .. });
        if !self.started && !is_start {
            return Err(EngineError::CorruptedHistory(format!(
                "{} delivered before ExecutionStarted",
                event.kind.type_name()
            )));
        }
        {
            let mut state = self.ctx.state();
            state.now_ms = state.now_ms.max(event.timestamp_ms);
        }
        debug!(
            instance_id = %self.instance.instance_id,
            sequence_id = event.sequence_id,
            kind = event.kind.type_name(),
            live,
            "delivering event"
        );

        match &event.kind {
            EventKind::ExecutionStarted { name, inputs } => self.start(name, inputs.clone())?,
            EventKind::CancelRequested { reason } => self.ctx.request_cancel(reason),
            EventKind::SignalReceived { name, arg } => {
                let waiter = self.signal_waiters.get_mut(name).and_then(VecDeque::pop_front);
                match waiter {
                    Some(id) => self.settle(id, Ok(arg.clone())),
                    None => self
                        .signal_buffer
                        .entry(name.clone())
                        .or_default()
                        .push_back(arg.clone()),
                }
            }
            EventKind::ActivityCompleted { .. } | EventKind::ActivityFailed { .. } | EventKind::TimerFired { .. } => {
                let id = self.correlation_id(event)?;
                if self.committed.contains_key(&id) {
                    self.complete(id, event)?;
                } else if self.deferred.insert(id, event.clone()).is_some() {
                    return Err(completed_twice(id, event));
                } else {
                    debug!(
                        instance_id = %self.instance.instance_id,
                        schedule_event_id = id,
                        "holding completion until its schedule is committed"
                    );
                }
            }
            other => {
                return Err(EngineError::CorruptedHistory(format!(
                    "{} is not an input event",
                    other.type_name()
                )));
            }
        }
        self.must_drive = true;
        Ok(())
    }

    fn start(&mut self, name: &str, inputs: Vec<Payload>) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::CorruptedHistory("ExecutionStarted recorded twice".to_string()));
        }
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownWorkflow(name.to_string()))?;
        let ctx = self.ctx.clone();
        let body = async move { handler.invoke(ctx, inputs).await };
        let root = AssertUnwindSafe(body).catch_unwind().map(|outcome| match outcome {
            Ok(outcome) => outcome,
            Err(panic) => Err(WorkflowError::Panicked(panic_message(panic.as_ref()))),
        });
        self.root = Some(Box::pin(root));
        self.started = true;
        Ok(())
    }

    fn correlation_id(&self, event: &HistoryEvent) -> Result<u64, EngineError> {
        event.schedule_event_id.ok_or_else(|| {
            EngineError::CorruptedHistory(format!(
                "{} at sequence {} carries no correlation id",
                event.kind.type_name(),
                event.sequence_id
            ))
        })
    }

    /// Settle a committed correlation id with a completion event.
    fn complete(&mut self, id: u64, event: &HistoryEvent) -> Result<(), EngineError> {
        let outcome = match (self.committed.get(&id), &event.kind) {
            (Some(PendingKind::Activity { .. }), EventKind::ActivityCompleted { result }) => Ok(Some(result.clone())),
            (Some(PendingKind::Activity { name }), EventKind::ActivityFailed { error }) => {
                Err(WorkflowError::ActivityFailed {
                    name: name.clone(),
                    message: error.clone(),
                })
            }
            (Some(PendingKind::Timer), EventKind::TimerFired { .. }) => Ok(None),
            (committed, _) => {
                let expected = match committed {
                    Some(PendingKind::Activity { .. }) => "an activity",
                    Some(PendingKind::Timer) => "a timer",
                    _ => "a signal subscription",
                };
                return Err(self.nondeterminism(format!(
                    "{} at sequence {} completes correlation id {id}, which is not {expected}",
                    event.kind.type_name(),
                    event.sequence_id
                )));
            }
        };
        if self.resolved.contains(&id) {
            return Err(completed_twice(id, event));
        }
        self.settle(id, outcome);
        Ok(())
    }

    fn settle(&mut self, id: u64, outcome: Result<Option<Payload>, WorkflowError>) {
        self.resolved.insert(id);
        let pending = self.ctx.state().pending.remove(&id);
        if let Some(pending) = pending {
            (pending.completer)(outcome);
        }
    }

    /// Bookkeeping once an action is part of history.
    fn record_commit(&mut self, action: &EmittedAction) -> Result<(), EngineError> {
        let id = action.id.unwrap_or(0);
        match &action.action {
            Action::ScheduleActivity { name, .. } => {
                self.committed.insert(id, PendingKind::Activity { name: name.clone() });
                self.settle_deferred(id)?;
            }
            Action::StartTimer { .. } => {
                self.committed.insert(id, PendingKind::Timer);
                self.settle_deferred(id)?;
            }
            Action::SubscribeSignal { name } => {
                self.committed.insert(id, PendingKind::Signal { name: name.clone() });
                let buffered = self.signal_buffer.get_mut(name).and_then(VecDeque::pop_front);
                match buffered {
                    Some(arg) => {
                        self.settle(id, Ok(arg));
                        self.must_drive = true;
                    }
                    None => self.signal_waiters.entry(name.clone()).or_default().push_back(id),
                }
            }
            Action::Complete { .. } | Action::Cancel { .. } => self.finished = true,
        }
        Ok(())
    }

    fn settle_deferred(&mut self, id: u64) -> Result<(), EngineError> {
        if let Some(event) = self.deferred.remove(&id) {
            self.complete(id, &event)?;
            self.must_drive = true;
        }
        Ok(())
    }

    fn drive_if_idle(&mut self) {
        if self.must_drive && self.ctx.state().emitted.is_empty() {
            self.must_drive = false;
            self.drive();
        }
    }

    /// Poll the root, then every sub-unit in creation order, until a full
    /// pass changes nothing.
    fn drive(&mut self) {
        if !self.started || self.root_done {
            return;
        }
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            let before = self.ctx.state().progress;

            let polled = match self.root.as_mut() {
                Some(root) => root.as_mut().poll(&mut cx),
                None => Poll::Pending,
            };
            if let Poll::Ready(outcome) = polled {
                self.root = None;
                self.root_done = true;
                self.queue_terminal(outcome);
                return;
            }

            let spawned = std::mem::take(&mut self.ctx.state().spawned);
            self.units.extend(spawned.into_iter().map(Some));

            let mut unit_finished = false;
            for slot in self.units.iter_mut() {
                let done = match slot {
                    Some(unit) => unit.as_mut().poll(&mut cx).is_ready(),
                    None => false,
                };
                if done {
                    *slot = None;
                    unit_finished = true;
                }
            }

            let moved = self.ctx.state().progress != before;
            if !unit_finished && !moved {
                break;
            }
        }
    }

    fn queue_terminal(&mut self, outcome: Result<Payload, WorkflowError>) {
        let mut state = self.ctx.state();
        let action = match outcome {
            Ok(result) => Action::Complete {
                result: Some(result),
                error: None,
            },
            Err(WorkflowError::Canceled) if state.canceled.is_some() => Action::Cancel {
                reason: state.canceled.clone().unwrap_or_default(),
            },
            Err(err) => Action::Complete {
                result: None,
                error: Some(err.to_string()),
            },
        };
        state.emitted.push_back(EmittedAction { id: None, action });
        state.progress += 1;
    }

    fn nondeterminism(&self, message: String) -> EngineError {
        error!(
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            %message,
            "non-deterministic workflow"
        );
        EngineError::NonDeterminism(message)
    }
}

fn completed_twice(id: u64, event: &HistoryEvent) -> EngineError {
    EngineError::CorruptedHistory(format!(
        "correlation id {id} completed twice (second at sequence {})",
        event.sequence_id
    ))
}

//! History event log.
//!
//! Every meaningful decision of a workflow instance is an immutable
//! [`HistoryEvent`] appended to its [`HistoryLog`]. Replaying the log through
//! the same workflow code rebuilds the exact same state.

use crate::errors::HistoryError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque serialized value (inputs, results, signal arguments).
pub type Payload = String;

/// Identity of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
}

impl WorkflowInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
        }
    }
}

impl std::fmt::Display for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.execution_id)
    }
}

/// Type-specific attributes of a history event.
///
/// Serialized as `{"type": ..., "attributes": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "attributes")]
pub enum EventKind {
    /// Opens the batch of events one task delivered. Workflow code is driven
    /// only once the whole batch is in.
    WorkflowTaskStarted,
    ExecutionStarted {
        name: String,
        inputs: Vec<Payload>,
    },
    ExecutionCompleted {
        result: Option<Payload>,
        error: Option<String>,
    },
    CancelRequested {
        reason: String,
    },
    ExecutionCanceled {
        reason: String,
    },
    ExecutionTerminated {
        reason: String,
    },
    SignalSubscribed {
        name: String,
    },
    SignalReceived {
        name: String,
        arg: Option<Payload>,
    },
    ActivityScheduled {
        name: String,
        inputs: Vec<Payload>,
    },
    ActivityCompleted {
        result: Payload,
    },
    ActivityFailed {
        error: String,
    },
    TimerScheduled {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
}

/// How the scheduler treats an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Drives the workflow forward (start, completions, signals, cancel requests).
    Input,
    /// Recorded consequence of a workflow decision; matched against replayed actions.
    Command,
    /// External termination; no workflow code runs.
    Termination,
    /// Task boundary.
    Marker,
}

impl EventKind {
    /// Stable type tag, used in logs and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::WorkflowTaskStarted => "WorkflowTaskStarted",
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::CancelRequested { .. } => "CancelRequested",
            EventKind::ExecutionCanceled { .. } => "ExecutionCanceled",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            EventKind::SignalSubscribed { .. } => "SignalSubscribed",
            EventKind::SignalReceived { .. } => "SignalReceived",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerScheduled { .. } => "TimerScheduled",
            EventKind::TimerFired { .. } => "TimerFired",
        }
    }

    pub fn class(&self) -> EventClass {
        match self {
            EventKind::ExecutionStarted { .. }
            | EventKind::CancelRequested { .. }
            | EventKind::SignalReceived { .. }
            | EventKind::ActivityCompleted { .. }
            | EventKind::ActivityFailed { .. }
            | EventKind::TimerFired { .. } => EventClass::Input,
            EventKind::ExecutionCompleted { .. }
            | EventKind::ExecutionCanceled { .. }
            | EventKind::SignalSubscribed { .. }
            | EventKind::ActivityScheduled { .. }
            | EventKind::TimerScheduled { .. } => EventClass::Command,
            EventKind::ExecutionTerminated { .. } => EventClass::Termination,
            EventKind::WorkflowTaskStarted => EventClass::Marker,
        }
    }

    /// Completed, canceled or terminated.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionCanceled { .. }
                | EventKind::ExecutionTerminated { .. }
        )
    }
}

/// One immutable entry of an instance's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Unique event identity, used to drop redelivered events.
    pub id: String,
    /// Position in the log, starting at 1. Zero until appended.
    pub sequence_id: u64,
    pub timestamp_ms: u64,
    /// Correlation id tying a completion to the action that scheduled it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_event_id: Option<u64>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HistoryEvent {
    /// New, not yet sequenced event with a random id.
    pub fn new(timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sequence_id: 0,
            timestamp_ms,
            schedule_event_id: None,
            kind,
        }
    }

    /// Event created by the engine itself. The id is derived from the
    /// execution and position so that reprocessing the same task produces
    /// byte-identical events.
    pub fn derived(execution_id: &str, sequence_id: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        let name = format!("{execution_id}/{sequence_id}");
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            sequence_id,
            timestamp_ms,
            schedule_event_id: None,
            kind,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_schedule_event_id(mut self, schedule_event_id: u64) -> Self {
        self.schedule_event_id = Some(schedule_event_id);
        self
    }

    pub fn with_sequence_id(mut self, sequence_id: u64) -> Self {
        self.sequence_id = sequence_id;
        self
    }
}

/// Instance identity paired with an event; the unit exchanged with backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance: WorkflowInstance,
    pub event: HistoryEvent,
}

impl WorkflowEvent {
    pub fn new(instance: WorkflowInstance, event: HistoryEvent) -> Self {
        Self { instance, event }
    }
}

/// Append-only, gap-free, ordered event log of a single instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryLog {
    events: Vec<HistoryEvent>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt committed history. Sequence ids must run 1, 2, 3, ...
    pub fn from_events(events: Vec<HistoryEvent>) -> Result<Self, HistoryError> {
        for (position, event) in events.iter().enumerate() {
            let expected = position as u64 + 1;
            if event.sequence_id != expected {
                return Err(HistoryError::NotContiguous {
                    position,
                    expected,
                    found: event.sequence_id,
                });
            }
        }
        Ok(Self { events })
    }

    /// Append `event`, assigning the next sequence id when it carries none.
    /// A pre-assigned id must be exactly the next one.
    pub fn append(&mut self, mut event: HistoryEvent) -> Result<&HistoryEvent, HistoryError> {
        let expected = self.last_sequence_id() + 1;
        match event.sequence_id {
            0 => event.sequence_id = expected,
            got if got < expected => return Err(HistoryError::BehindCursor { expected, got }),
            got if got > expected => return Err(HistoryError::Gap { expected, got }),
            _ => {}
        }
        self.events.push(event);
        Ok(&self.events[self.events.len() - 1])
    }

    /// Ordered tail starting at `from_seq` (inclusive). `0` and `1` both read everything.
    pub fn read(&self, from_seq: u64) -> &[HistoryEvent] {
        let start = (from_seq.max(1) - 1) as usize;
        self.events.get(start..).unwrap_or(&[])
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<HistoryEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_sequence_id(&self) -> u64 {
        self.events.last().map(|e| e.sequence_id).unwrap_or(0)
    }

    /// True once a completed, canceled or terminated event was recorded.
    pub fn is_terminal(&self) -> bool {
        self.events.iter().rev().any(|e| e.kind.is_terminal())
    }
}

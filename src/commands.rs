//! Commands produced by a task and the actions workflow code emits.

use crate::history::{EventKind, HistoryEvent, Payload};
use serde::{Deserialize, Serialize};

/// Outbound instruction for the backend to persist and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    ScheduleActivity {
        id: u64,
        name: String,
        inputs: Vec<Payload>,
    },
    ScheduleTimer {
        id: u64,
        fire_at_ms: u64,
    },
    WaitSignal {
        id: u64,
        name: String,
    },
    CompleteInstance {
        result: Option<Payload>,
        error: Option<String>,
    },
    CancelInstance {
        reason: String,
    },
}

/// Decision taken by workflow code, queued until it is matched against
/// history (replay) or committed (live).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    ScheduleActivity { name: String, inputs: Vec<Payload> },
    StartTimer { fire_at_ms: u64 },
    SubscribeSignal { name: String },
    Complete { result: Option<Payload>, error: Option<String> },
    Cancel { reason: String },
}

/// Action together with its correlation id; terminal actions carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EmittedAction {
    pub(crate) id: Option<u64>,
    pub(crate) action: Action,
}

impl EmittedAction {
    /// History event recording this action.
    pub(crate) fn to_event_kind(&self) -> EventKind {
        match &self.action {
            Action::ScheduleActivity { name, inputs } => EventKind::ActivityScheduled {
                name: name.clone(),
                inputs: inputs.clone(),
            },
            Action::StartTimer { fire_at_ms } => EventKind::TimerScheduled {
                fire_at_ms: *fire_at_ms,
            },
            Action::SubscribeSignal { name } => EventKind::SignalSubscribed { name: name.clone() },
            Action::Complete { result, error } => EventKind::ExecutionCompleted {
                result: result.clone(),
                error: error.clone(),
            },
            Action::Cancel { reason } => EventKind::ExecutionCanceled { reason: reason.clone() },
        }
    }

    pub(crate) fn to_command(&self) -> Command {
        let id = self.id.unwrap_or(0);
        match &self.action {
            Action::ScheduleActivity { name, inputs } => Command::ScheduleActivity {
                id,
                name: name.clone(),
                inputs: inputs.clone(),
            },
            Action::StartTimer { fire_at_ms } => Command::ScheduleTimer {
                id,
                fire_at_ms: *fire_at_ms,
            },
            Action::SubscribeSignal { name } => Command::WaitSignal { id, name: name.clone() },
            Action::Complete { result, error } => Command::CompleteInstance {
                result: result.clone(),
                error: error.clone(),
            },
            Action::Cancel { reason } => Command::CancelInstance { reason: reason.clone() },
        }
    }

    /// Compare against a recorded command event. Returns a description of the
    /// first difference, `None` when they agree.
    pub(crate) fn mismatch(&self, event: &HistoryEvent) -> Option<String> {
        let expected = self.to_event_kind();
        if expected.type_name() != event.kind.type_name() {
            return Some(format!(
                "history has {} at sequence {} but workflow emitted {}",
                event.kind.type_name(),
                event.sequence_id,
                expected.type_name()
            ));
        }
        if self.id != event.schedule_event_id {
            return Some(format!(
                "{} at sequence {} has correlation id {:?} but workflow emitted {:?}",
                event.kind.type_name(),
                event.sequence_id,
                event.schedule_event_id,
                self.id
            ));
        }
        if expected != event.kind {
            return Some(format!(
                "{} at sequence {} differs: recorded {:?}, emitted {:?}",
                event.kind.type_name(),
                event.sequence_id,
                event.kind,
                expected
            ));
        }
        None
    }
}

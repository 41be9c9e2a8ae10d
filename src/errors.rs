//! Error taxonomy.
//!
//! Two families exist and they never mix:
//!
//! - [`WorkflowError`] is what workflow code observes and returns. Activity
//!   failures, cancellation and termination arrive here as ordinary values so
//!   workflow code can compensate; whatever the workflow finally returns is
//!   recorded into history instead of crashing the engine.
//! - [`EngineError`] aborts the current task attempt. Non-determinism,
//!   corrupted history and other engine-local faults are surfaced to the
//!   caller and are never patched over.

use serde::{Deserialize, Serialize};

/// Error observed by (or returned from) workflow code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum WorkflowError {
    /// An activity completed with a failure.
    #[error("activity '{name}' failed: {message}")]
    ActivityFailed { name: String, message: String },
    /// The instance (or the wait) was canceled.
    #[error("workflow canceled")]
    Canceled,
    /// The instance was terminated externally.
    #[error("workflow terminated")]
    Terminated,
    /// Business-logic failure raised by workflow code.
    #[error("{0}")]
    Application(String),
    /// A payload could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(String),
    /// `Selector::select` was called with no case left to fire.
    #[error("selector has no pending cases")]
    EmptySelector,
    /// Workflow code panicked.
    #[error("workflow panicked: {0}")]
    Panicked(String),
}

impl WorkflowError {
    /// Convenience constructor for business-logic failures.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// True for the cancellation sentinel.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<CodecError> for WorkflowError {
    fn from(err: CodecError) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Fault that aborts a task attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Replay produced a command sequence that diverges from recorded history.
    #[error("nondeterministic workflow: {0}")]
    NonDeterminism(String),
    /// The history log rejected an append.
    #[error(transparent)]
    History(#[from] HistoryError),
    /// History is structurally invalid (for example it does not start with `ExecutionStarted`).
    #[error("corrupted history: {0}")]
    CorruptedHistory(String),
    /// No handler is registered under the started workflow's name.
    #[error("workflow '{0}' is not registered")]
    UnknownWorkflow(String),
    /// Registration violated the workflow contract.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

impl EngineError {
    /// True when the fault is a determinism violation.
    pub fn is_nondeterminism(&self) -> bool {
        matches!(self, Self::NonDeterminism(_))
    }
}

/// Append/read failures of the history log. Always a programming error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("append behind cursor: event carries sequence {got}, next is {expected}")]
    BehindCursor { expected: u64, got: u64 },
    #[error("sequence gap: event carries sequence {got}, next is {expected}")]
    Gap { expected: u64, got: u64 },
    #[error("committed history is not contiguous at position {position}: expected {expected}, found {found}")]
    NotContiguous { position: usize, expected: u64, found: u64 },
}

/// Workflow registration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow '{0}' registered more than once")]
    Duplicate(String),
    #[error("workflow name must not be empty")]
    EmptyName,
}

/// Payload conversion failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

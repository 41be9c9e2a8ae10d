/// Backend error with retry classification.
///
/// Backends return this to tell callers whether repeating the operation can
/// succeed.
///
/// **Retryable**: storage busy, connection timeouts, instance locked by a
/// task in flight.
///
/// **Permanent**: unknown instance, duplicate instance id, invalid input,
/// operations on finished instances.
///
/// ```rust
/// use durable_workflows::backend::BackendError;
///
/// let busy = BackendError::retryable("next_task", "store is busy");
/// assert!(busy.is_retryable());
/// let dup = BackendError::permanent("create_workflow_instance", "instance exists");
/// assert!(!dup.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct BackendError {
    /// Operation that failed (e.g. "signal_workflow").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl BackendError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, BackendError, Stats};
use crate::clock::{Clock, SystemClock};
use crate::codec::{self, Args, Converter, JsonConverter};
use crate::errors::CodecError;
use crate::history::{EventKind, HistoryEvent, WorkflowEvent, WorkflowInstance};
use crate::runtime::WorkflowState;

/// Errors surfaced by [`Client`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("timed out waiting for workflow instance")]
    Timeout,
    #[error("workflow failed: {0}")]
    WorkflowFailed(String),
    #[error("workflow canceled: {0}")]
    WorkflowCanceled(String),
    #[error("workflow terminated: {0}")]
    WorkflowTerminated(String),
    #[error("workflow has no result")]
    ResultNotFound,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How often `wait_for_workflow_instance` polls the backend.
    /// Default: 200ms
    pub poll_interval: Duration,
    /// Wait used when callers pass no timeout.
    /// Default: 20s
    pub default_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            default_timeout: Duration::from_secs(20),
        }
    }
}

/// Per-instance start options.
#[derive(Debug, Clone, Default)]
pub struct WorkflowInstanceOptions {
    /// Caller-chosen instance id; a random one is generated when absent.
    pub instance_id: Option<String>,
}

impl WorkflowInstanceOptions {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
        }
    }
}

/// Control-plane API. Talks to the engine exclusively through the backend.
pub struct Client {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    converter: Arc<dyn Converter>,
    options: ClientOptions,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            converter: Arc::new(JsonConverter),
            options: ClientOptions::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    fn event(&self, kind: EventKind) -> HistoryEvent {
        HistoryEvent::new(self.clock.now_ms(), kind)
    }

    /// Start a new instance of `workflow_name`. Every call begins a fresh execution.
    pub async fn create_workflow_instance(
        &self,
        options: WorkflowInstanceOptions,
        workflow_name: &str,
        args: impl Args,
    ) -> Result<WorkflowInstance, ClientError> {
        let inputs = args.into_payloads(self.converter.as_ref())?;
        let instance_id = options.instance_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let instance = WorkflowInstance::new(instance_id, Uuid::new_v4().to_string());
        let start = self.event(EventKind::ExecutionStarted {
            name: workflow_name.to_string(),
            inputs,
        });
        self.backend
            .create_workflow_instance(WorkflowEvent::new(instance.clone(), start))
            .await?;
        debug!(instance_id = %instance.instance_id, execution_id = %instance.execution_id, workflow = workflow_name, "workflow instance created");
        Ok(instance)
    }

    /// Request cooperative cancellation.
    pub async fn cancel_workflow_instance(&self, instance: &WorkflowInstance, reason: &str) -> Result<(), ClientError> {
        let event = self.event(EventKind::CancelRequested {
            reason: reason.to_string(),
        });
        Ok(self.backend.cancel_workflow_instance(instance, event).await?)
    }

    pub async fn signal_workflow<T: Serialize>(
        &self,
        instance_id: &str,
        name: &str,
        arg: &T,
    ) -> Result<(), ClientError> {
        let arg = codec::encode(self.converter.as_ref(), arg)?;
        let event = self.event(EventKind::SignalReceived {
            name: name.to_string(),
            arg: Some(arg),
        });
        Ok(self.backend.signal_workflow(instance_id, event).await?)
    }

    /// Stop an instance immediately; its code does not run again.
    pub async fn terminate_workflow_instance(&self, instance: &WorkflowInstance, reason: &str) -> Result<(), ClientError> {
        let event = self.event(EventKind::ExecutionTerminated {
            reason: reason.to_string(),
        });
        Ok(self.backend.terminate_workflow_instance(instance, event).await?)
    }

    /// Poll until the instance is finished or `timeout` (default 20s) expires.
    pub async fn wait_for_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let timeout = timeout.unwrap_or(self.options.default_timeout);
        let poll = async {
            loop {
                if self.backend.get_workflow_instance_state(instance).await? == WorkflowState::Finished {
                    return Ok::<(), ClientError>(());
                }
                tokio::time::sleep(self.options.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| ClientError::Timeout)?
    }

    /// Wait for the instance and decode its result.
    ///
    /// History is scanned backwards for the terminal event.
    pub async fn get_workflow_result<T: DeserializeOwned>(
        &self,
        instance: &WorkflowInstance,
        timeout: Option<Duration>,
    ) -> Result<T, ClientError> {
        self.wait_for_workflow_instance(instance, timeout).await?;
        let history = self.backend.get_workflow_instance_history(instance).await?;
        for event in history.iter().rev() {
            match &event.kind {
                EventKind::ExecutionCompleted { error: Some(error), .. } => {
                    return Err(ClientError::WorkflowFailed(error.clone()));
                }
                EventKind::ExecutionCompleted { result, .. } => {
                    let payload = result.as_deref().unwrap_or("null");
                    return Ok(codec::decode(self.converter.as_ref(), payload)?);
                }
                EventKind::ExecutionCanceled { reason } => return Err(ClientError::WorkflowCanceled(reason.clone())),
                EventKind::ExecutionTerminated { reason } => {
                    return Err(ClientError::WorkflowTerminated(reason.clone()));
                }
                _ => {}
            }
        }
        Err(ClientError::ResultNotFound)
    }

    pub async fn get_stats(&self) -> Result<Stats, ClientError> {
        Ok(self.backend.get_stats().await?)
    }
}

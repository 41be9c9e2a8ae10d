//! Workflow registration: name -> handler.

use crate::WorkflowContext;
use crate::codec;
use crate::errors::{DefinitionError, WorkflowError};
use crate::history::Payload;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Implemented by workflow entry points the runtime can invoke.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, inputs: Vec<Payload>) -> Result<Payload, WorkflowError>;
}

/// Function wrapper that implements `WorkflowHandler` over raw payloads.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, inputs: Vec<Payload>) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, inputs).await
    }
}

/// Typed adapter: decodes the inputs into `In` and encodes the `Out` result.
///
/// No inputs decode from `null`, one input decodes as itself, several decode
/// from an array.
struct TypedWorkflow<In, Out, F> {
    f: F,
    _types: PhantomData<fn(In) -> Out>,
}

#[async_trait]
impl<In, Out, F, Fut> WorkflowHandler for TypedWorkflow<In, Out, F>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, inputs: Vec<Payload>) -> Result<Payload, WorkflowError> {
        let value = codec::inputs_to_value(ctx.converter(), &inputs)?;
        let input: In = serde_json::from_value(value).map_err(|e| WorkflowError::Serialization(e.to_string()))?;
        let converter_ctx = ctx.clone();
        let out = (self.f)(ctx, input).await?;
        Ok(codec::encode(converter_ctx.converter(), &out)?)
    }
}

/// Immutable set of registered workflows.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.list_names();
        names.sort();
        f.debug_struct("WorkflowRegistry").field("workflows", &names).finish()
    }
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        let handler = self.inner.get(name).cloned();
        if handler.is_none() {
            tracing::debug!(
                target: "durable_workflows::runtime::registry",
                requested_name = %name,
                registered = ?self.list_names(),
                "workflow not found in registry"
            );
        }
        handler
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

/// Collects registrations; problems are reported together by [`build`](Self::build).
pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<dyn WorkflowHandler>>,
    errors: Vec<DefinitionError>,
}

impl WorkflowRegistryBuilder {
    /// Register a handler over raw payloads.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnWorkflow(f)))
    }

    /// Register a handler with typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.register_handler(
            name,
            Arc::new(TypedWorkflow {
                f,
                _types: PhantomData,
            }),
        )
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) -> Self {
        let name = name.into();
        if name.is_empty() {
            self.errors.push(DefinitionError::EmptyName);
        } else if self.map.contains_key(&name) {
            self.errors.push(DefinitionError::Duplicate(name));
        } else {
            self.map.insert(name, handler);
        }
        self
    }

    /// Finish registration, failing on the first recorded problem.
    pub fn build(self) -> Result<WorkflowRegistry, DefinitionError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        Ok(WorkflowRegistry {
            inner: Arc::new(self.map),
        })
    }
}

//! Deterministic, event-sourced execution of durable workflows.
//!
//! Workflow code is ordinary `async` Rust that talks to the outside world only
//! through a [`WorkflowContext`]: activities, timers, signals and spawned
//! sub-units. Every decision is recorded into an append-only history; after a
//! crash or on another worker the same code is replayed against that history
//! and lands in exactly the same state without re-running side effects.
//!
//! ```ignore
//! let registry = WorkflowRegistry::builder()
//!     .register_typed("Greeter", |ctx: WorkflowContext, name: String| async move {
//!         let greeting: String = ctx.execute_activity("Greet", (name,)).get(&ctx).await?;
//!         ctx.sleep(Duration::from_secs(5)).await?;
//!         Ok(greeting)
//!     })
//!     .build()?;
//! let executor = TaskExecutor::new(registry, EngineOptions::default());
//! let result = executor.execute(task)?;
//! ```
//!
//! Workflow code must be deterministic: no wall-clock reads (use
//! [`WorkflowContext::now_ms`]), no iteration over unordered containers, no
//! native threads, tasks or locks. Those rules are enforced by review and
//! tooling outside this crate; the runtime assumes they hold.

pub mod backend;
pub mod client;
pub mod clock;
pub mod codec;
pub mod commands;
pub mod errors;
pub mod futures;
pub mod history;
pub mod logging;
pub mod runtime;
pub mod selector;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Args, Converter, JsonConverter};
pub use commands::Command;
pub use errors::{CodecError, DefinitionError, EngineError, HistoryError, WorkflowError};
pub use futures::{Resolver, WorkflowFuture, new_future};
pub use history::{EventKind, HistoryEvent, HistoryLog, Payload, WorkflowEvent, WorkflowInstance};
pub use runtime::registry::{WorkflowHandler, WorkflowRegistry};
pub use runtime::{EngineOptions, TaskExecutor, TaskResult, WorkflowState, WorkflowTask};
pub use selector::Selector;

use crate::commands::{Action, EmittedAction};
use ::futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A spawned sub-unit of control, driven by the scheduler.
pub(crate) type Unit = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Settles an engine-resolved future from a history payload.
pub(crate) type Completer = Box<dyn FnOnce(Result<Option<Payload>, WorkflowError>) + Send>;

/// What an outstanding correlation id is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Activity { name: String },
    Timer,
    Signal { name: String },
}

pub(crate) struct PendingCompletion {
    pub(crate) kind: PendingKind,
    pub(crate) completer: Completer,
}

/// Derived, never persisted, state shared between workflow code and the scheduler.
pub(crate) struct ExecutionState {
    pub(crate) instance: WorkflowInstance,
    pub(crate) replaying: bool,
    pub(crate) canceled: Option<String>,
    /// Logical time: timestamp of the last processed input event.
    pub(crate) now_ms: u64,
    next_correlation_id: u64,
    pub(crate) emitted: VecDeque<EmittedAction>,
    pub(crate) pending: BTreeMap<u64, PendingCompletion>,
    /// Units spawned since the scheduler last adopted them.
    pub(crate) spawned: Vec<Unit>,
    /// Bumped on every emission or spawn; the driver loops while it moves.
    pub(crate) progress: u64,
}

impl ExecutionState {
    fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            replaying: false,
            canceled: None,
            now_ms: 0,
            next_correlation_id: 0,
            emitted: VecDeque::new(),
            pending: BTreeMap::new(),
            spawned: Vec::new(),
            progress: 0,
        }
    }

    fn emit(&mut self, action: Action, pending: PendingCompletion) -> u64 {
        self.next_correlation_id += 1;
        let id = self.next_correlation_id;
        self.emitted.push_back(EmittedAction { id: Some(id), action });
        self.pending.insert(id, pending);
        self.progress += 1;
        id
    }
}

/// Handle through which workflow code interacts with the engine.
///
/// Cheap to clone; all clones share one execution state.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Arc<Mutex<ExecutionState>>,
    converter: Arc<dyn Converter>,
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("WorkflowContext")
            .field("instance", &state.instance)
            .field("replaying", &state.replaying)
            .field("now_ms", &state.now_ms)
            .finish()
    }
}

impl WorkflowContext {
    pub(crate) fn new(instance: WorkflowInstance, converter: Arc<dyn Converter>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ExecutionState::new(instance))),
            converter,
        }
    }

    /// Context not attached to any scheduler.
    #[cfg(test)]
    pub(crate) fn detached(instance_id: &str) -> Self {
        Self::new(
            WorkflowInstance::new(instance_id, "detached"),
            Arc::new(JsonConverter),
        )
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn request_cancel(&self, reason: &str) {
        let mut state = self.state();
        if state.canceled.is_none() {
            state.canceled = Some(reason.to_string());
        }
    }

    pub fn instance(&self) -> WorkflowInstance {
        self.state().instance.clone()
    }

    pub fn instance_id(&self) -> String {
        self.state().instance.instance_id.clone()
    }

    /// True while the scheduler is re-executing recorded history.
    ///
    /// Diagnostic only: branching on it makes the workflow nondeterministic.
    /// Use the `workflow_*!` logging macros instead of checking it by hand.
    pub fn is_replaying(&self) -> bool {
        self.state().replaying
    }

    /// Deterministic current time in milliseconds since the Unix epoch.
    pub fn now_ms(&self) -> u64 {
        self.state().now_ms
    }

    /// True once a cancel request has been delivered to this instance.
    pub fn is_canceled(&self) -> bool {
        self.state().canceled.is_some()
    }

    pub fn converter(&self) -> &dyn Converter {
        self.converter.as_ref()
    }

    /// Schedule an activity and return the future of its result.
    ///
    /// Arguments that fail to encode yield an already failed future and
    /// nothing is scheduled.
    pub fn execute_activity<R>(&self, name: impl Into<String>, args: impl Args) -> WorkflowFuture<R>
    where
        R: DeserializeOwned + Clone + Send + 'static,
    {
        let name = name.into();
        let inputs = match args.into_payloads(self.converter()) {
            Ok(inputs) => inputs,
            Err(e) => return WorkflowFuture::failed(e.into()),
        };
        let (future, resolver) = new_future();
        let completer = self.completer(resolver);
        self.state().emit(
            Action::ScheduleActivity {
                name: name.clone(),
                inputs,
            },
            PendingCompletion {
                kind: PendingKind::Activity { name },
                completer,
            },
        );
        future
    }

    /// Durable timer firing `delay` after the current logical time.
    pub fn schedule_timer(&self, delay: Duration) -> WorkflowFuture<()> {
        let (future, resolver) = new_future();
        let completer = self.completer(resolver);
        let mut state = self.state();
        let fire_at_ms = state.now_ms.saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        state.emit(
            Action::StartTimer { fire_at_ms },
            PendingCompletion {
                kind: PendingKind::Timer,
                completer,
            },
        );
        future
    }

    /// Schedule a timer and wait for it.
    pub fn sleep(&self, delay: Duration) -> impl Future<Output = Result<(), WorkflowError>> + Send + 'static {
        let timer = self.schedule_timer(delay);
        let ctx = self.clone();
        async move { timer.get(&ctx).await }
    }

    /// Wait for the next signal named `name`.
    ///
    /// The n-th subscription to a name receives the n-th signal of that name;
    /// signals that arrive before anyone waits are buffered.
    pub fn wait_signal<T>(&self, name: impl Into<String>) -> WorkflowFuture<T>
    where
        T: DeserializeOwned + Clone + Send + 'static,
    {
        let name = name.into();
        let (future, resolver) = new_future();
        let completer = self.completer(resolver);
        self.state().emit(
            Action::SubscribeSignal { name: name.clone() },
            PendingCompletion {
                kind: PendingKind::Signal { name },
                completer,
            },
        );
        future
    }

    /// Run `future` as a deterministic sub-unit of this instance.
    ///
    /// Sub-units are interleaved with the workflow one at a time, in creation
    /// order. The returned future settles with the sub-unit's outcome; a panic
    /// inside it becomes [`WorkflowError::Panicked`].
    pub fn spawn<T, F>(&self, future: F) -> WorkflowFuture<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, WorkflowError>> + Send + 'static,
    {
        let (handle, resolver) = new_future();
        let unit = async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(WorkflowError::Panicked(runtime::panic_message(panic.as_ref()))),
            };
            resolver.complete(outcome);
        };
        let mut state = self.state();
        state.spawned.push(Box::pin(unit));
        state.progress += 1;
        handle
    }

    fn completer<T>(&self, resolver: Resolver<T>) -> Completer
    where
        T: DeserializeOwned + Send + 'static,
    {
        let converter = Arc::clone(&self.converter);
        Box::new(move |outcome| {
            let decoded = outcome.and_then(|payload| {
                let value = match payload {
                    Some(p) => converter.from_payload(&p)?,
                    None => serde_json::Value::Null,
                };
                serde_json::from_value::<T>(value).map_err(|e| WorkflowError::Serialization(e.to_string()))
            });
            resolver.complete(decoded);
        })
    }
}

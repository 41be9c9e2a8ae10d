#![allow(dead_code)]

pub mod log_capture;

use durable_workflows::backend::InMemoryBackend;
use durable_workflows::{
    EngineError, EngineOptions, EventKind, HistoryEvent, ManualClock, Payload, Selector, TaskExecutor, TaskResult,
    WorkflowContext, WorkflowError, WorkflowInstance, WorkflowRegistry, WorkflowState, WorkflowTask,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

pub const TEST_INSTANCE: &str = "test-instance";
pub const TEST_EXECUTION: &str = "test-execution";
pub const START_MS: u64 = 1_000;

pub fn instance() -> WorkflowInstance {
    WorkflowInstance::new(TEST_INSTANCE, TEST_EXECUTION)
}

// ============================================================================
// Event builders
//
// New events carry sequence id 0; hand-built committed histories go through
// `sequenced`.
// ============================================================================

pub fn started(name: &str, inputs: &[&str]) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::ExecutionStarted {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        },
    )
}

pub fn activity_scheduled(id: u64, name: &str, inputs: &[&str]) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::ActivityScheduled {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        },
    )
    .with_schedule_event_id(id)
}

pub fn activity_completed(id: u64, result: &str) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::ActivityCompleted {
            result: result.to_string(),
        },
    )
    .with_schedule_event_id(id)
}

pub fn activity_failed(id: u64, error: &str) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::ActivityFailed {
            error: error.to_string(),
        },
    )
    .with_schedule_event_id(id)
}

pub fn timer_scheduled(id: u64, fire_at_ms: u64) -> HistoryEvent {
    HistoryEvent::new(START_MS, EventKind::TimerScheduled { fire_at_ms }).with_schedule_event_id(id)
}

pub fn timer_fired(id: u64, fire_at_ms: u64) -> HistoryEvent {
    HistoryEvent::new(fire_at_ms, EventKind::TimerFired { fire_at_ms }).with_schedule_event_id(id)
}

pub fn signal_subscribed(id: u64, name: &str) -> HistoryEvent {
    HistoryEvent::new(START_MS, EventKind::SignalSubscribed { name: name.to_string() }).with_schedule_event_id(id)
}

pub fn signal(name: &str, arg: &str) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::SignalReceived {
            name: name.to_string(),
            arg: Some(arg.to_string()),
        },
    )
}

pub fn cancel_requested(reason: &str) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::CancelRequested {
            reason: reason.to_string(),
        },
    )
}

pub fn terminated(reason: &str) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::ExecutionTerminated {
            reason: reason.to_string(),
        },
    )
}

pub fn completed(result: &str) -> HistoryEvent {
    HistoryEvent::new(
        START_MS,
        EventKind::ExecutionCompleted {
            result: Some(result.to_string()),
            error: None,
        },
    )
}

/// Number events 1, 2, 3, ... as committed history.
pub fn sequenced(events: Vec<HistoryEvent>) -> Vec<HistoryEvent> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.with_sequence_id(i as u64 + 1))
        .collect()
}

// ============================================================================
// Executor helpers
// ============================================================================

pub fn executor(registry: WorkflowRegistry) -> TaskExecutor {
    TaskExecutor::new(
        registry,
        EngineOptions::default().with_clock(Arc::new(ManualClock::new(START_MS))),
    )
}

pub fn uncached_executor(registry: WorkflowRegistry) -> TaskExecutor {
    TaskExecutor::new(
        registry,
        EngineOptions::default()
            .with_clock(Arc::new(ManualClock::new(START_MS)))
            .with_cache_capacity(0),
    )
}

/// One instance's committed history plus the executor that advances it,
/// standing in for a backend in engine-level tests.
pub struct Harness {
    pub executor: TaskExecutor,
    pub instance: WorkflowInstance,
    pub history: Vec<HistoryEvent>,
}

impl Harness {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            executor,
            instance: instance(),
            history: Vec::new(),
        }
    }

    /// Run one task and commit its events.
    pub fn step(&mut self, new_events: Vec<HistoryEvent>) -> Result<TaskResult, EngineError> {
        let result = self.executor.execute(WorkflowTask {
            instance: self.instance.clone(),
            history: self.history.clone(),
            new_events,
        })?;
        self.history.extend(result.new_events.iter().cloned());
        Ok(result)
    }

    pub fn is_finished(&self) -> bool {
        self.history.iter().any(|e| e.kind.is_terminal())
    }

    pub fn terminal(&self) -> Option<&EventKind> {
        self.history.iter().rev().map(|e| &e.kind).find(|k| k.is_terminal())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.history.iter().map(|e| e.kind.type_name()).collect()
    }
}

/// Drive everything pending in `backend` to quiescence: run tasks, execute
/// activities with `activity`, fire due timers.
pub async fn run_backend<F>(backend: &InMemoryBackend, executor: &TaskExecutor, activity: F)
where
    F: Fn(&str, &[Payload]) -> Result<Payload, String>,
{
    loop {
        let mut progressed = false;
        while let Some(task) = backend.next_task().await {
            progressed = true;
            let instance = task.instance.clone();
            match executor.execute(task) {
                Ok(result) => backend.commit_task(result).await.unwrap(),
                Err(e) => {
                    backend.abandon_task(&instance).await.unwrap();
                    panic!("task for {instance} failed: {e}");
                }
            }
        }
        for task in backend.pending_activities().await {
            progressed = true;
            match activity(&task.name, &task.inputs) {
                Ok(result) => backend.complete_activity(&task, result).await.unwrap(),
                Err(error) => backend.fail_activity(&task, error).await.unwrap(),
            }
        }
        if !progressed {
            if let Some(timer) = backend.pending_timers().await.into_iter().min_by_key(|t| t.fire_at_ms) {
                backend.fire_timer(&timer).await.unwrap();
                continue;
            }
            break;
        }
    }
}

// ============================================================================
// Sample workflows
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Age")]
    pub age: i64,
}

pub const PERSON_JOHN: &str = r#"{"Name":"John","Age":35}"#;

/// Schedules Activity1(age, 12) and Activity2() up front, then sums the results.
pub async fn two_activities(ctx: WorkflowContext, person: Person) -> Result<i64, WorkflowError> {
    let first = ctx.execute_activity::<i64>("Activity1", (person.age, 12));
    let second = ctx.execute_activity::<i64>("Activity2", ());
    let r1 = first.get(&ctx).await?;
    let r2 = second.get(&ctx).await?;
    Ok(r1 + r2)
}

/// Runs `Step` once per input element, strictly in sequence.
pub async fn sequence(ctx: WorkflowContext, steps: Vec<String>) -> Result<Vec<String>, WorkflowError> {
    let mut out = Vec::new();
    for step in steps {
        let r: String = ctx.execute_activity("Step", (step,)).get(&ctx).await?;
        out.push(r);
    }
    Ok(out)
}

/// Sleeps five seconds and reports logical time before and after.
pub async fn nap(ctx: WorkflowContext, _input: ()) -> Result<(u64, u64), WorkflowError> {
    let before = ctx.now_ms();
    ctx.sleep(Duration::from_secs(5)).await?;
    Ok((before, ctx.now_ms()))
}

/// Two activities behind a selector; returns callback order.
pub async fn race(ctx: WorkflowContext, _input: ()) -> Result<Vec<String>, WorkflowError> {
    let a = ctx.execute_activity::<String>("A", ());
    let b = ctx.execute_activity::<String>("B", ());
    let mut selector = Selector::new();
    selector
        .add_future(&a, |r| format!("a:{}", r.unwrap_or_default()))
        .add_future(&b, |r| format!("b:{}", r.unwrap_or_default()));
    let first = selector.select(&ctx).await?;
    let second = selector.select(&ctx).await?;
    Ok(vec![first, second])
}

/// Waits for an `approve` signal or a one-hour deadline.
pub async fn approval(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    let decision = ctx.wait_signal::<bool>("approve");
    let deadline = ctx.schedule_timer(Duration::from_secs(3600));
    let mut selector = Selector::new();
    selector
        .add_future(&decision, |r| match r {
            Ok(true) => "approved".to_string(),
            Ok(false) => "rejected".to_string(),
            Err(e) => format!("error: {e}"),
        })
        .add_future(&deadline, |_| "expired".to_string());
    selector.select(&ctx).await
}

/// Collects `count` signals named `item`, in order.
pub async fn collect(ctx: WorkflowContext, count: u32) -> Result<Vec<String>, WorkflowError> {
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(ctx.wait_signal::<String>("item").get(&ctx).await?);
    }
    Ok(items)
}

/// Fans out one sub-unit per input, each calling `Work` then sleeping.
pub async fn fan_out(ctx: WorkflowContext, inputs: Vec<i64>) -> Result<i64, WorkflowError> {
    let mut handles = Vec::new();
    for n in inputs {
        let child = ctx.clone();
        handles.push(ctx.spawn(async move {
            let doubled: i64 = child.execute_activity("Work", (n,)).get(&child).await?;
            child.sleep(Duration::from_secs(1)).await?;
            Ok(doubled)
        }));
    }
    let mut total = 0;
    for handle in &handles {
        total += handle.get(&ctx).await?;
    }
    Ok(total)
}

/// Blocks on an activity; on cancellation runs `Cleanup` and still reports
/// the cancellation.
pub async fn cancellable(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    match ctx.execute_activity::<String>("Slow", ()).get(&ctx).await {
        Ok(v) => Ok(v),
        Err(WorkflowError::Canceled) => {
            workflow_cleanup(&ctx).await;
            Err(WorkflowError::Canceled)
        }
        Err(e) => Err(e),
    }
}

async fn workflow_cleanup(ctx: &WorkflowContext) {
    // Once canceled every pending get fails immediately, so only schedule.
    let _ = ctx.execute_activity::<()>("Cleanup", ());
}

/// Propagates activity failure.
pub async fn fragile(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    ctx.execute_activity::<String>("MayFail", ()).get(&ctx).await
}

/// Handles activity failure by compensating.
pub async fn compensating(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    match ctx.execute_activity::<String>("Charge", ()).get(&ctx).await {
        Ok(_) => Ok("charged".to_string()),
        Err(WorkflowError::ActivityFailed { .. }) => {
            ctx.execute_activity::<String>("Refund", ()).get(&ctx).await?;
            Ok("refunded".to_string())
        }
        Err(e) => Err(e),
    }
}

pub fn registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register_typed("TwoActivities", two_activities)
        .register_typed("Sequence", sequence)
        .register_typed("Nap", nap)
        .register_typed("Race", race)
        .register_typed("Approval", approval)
        .register_typed("Collect", collect)
        .register_typed("FanOut", fan_out)
        .register_typed("Cancellable", cancellable)
        .register_typed("Fragile", fragile)
        .register_typed("Compensating", compensating)
        .build()
        .unwrap()
}

pub fn assert_nondeterminism(result: &Result<TaskResult, EngineError>) {
    match result {
        Err(EngineError::NonDeterminism(_)) => {}
        other => panic!("expected non-determinism fault, got {other:?}"),
    }
}

pub fn assert_running(result: &TaskResult) {
    assert_eq!(result.state, WorkflowState::Running);
}

pub fn assert_finished(result: &TaskResult) {
    assert_eq!(result.state, WorkflowState::Finished);
}

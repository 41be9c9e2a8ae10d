mod common;

use common::*;
use durable_workflows::{Command, EventKind, WorkflowContext, WorkflowError, WorkflowRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn complete(result: &str) -> Command {
    Command::CompleteInstance {
        result: Some(result.to_string()),
        error: None,
    }
}

fn failed(error: &str) -> Command {
    Command::CompleteInstance {
        result: None,
        error: Some(error.to_string()),
    }
}

fn schedule(id: u64, name: &str, inputs: &[&str]) -> Command {
    Command::ScheduleActivity {
        id,
        name: name.to_string(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn two_activities_schedule_up_front_and_complete_with_sum() {
    let mut h = Harness::new(executor(registry()));

    let first = h.step(vec![started("TwoActivities", &[PERSON_JOHN])]).unwrap();
    assert_running(&first);
    assert_eq!(
        first.commands,
        vec![schedule(1, "Activity1", &["35", "12"]), schedule(2, "Activity2", &[])]
    );

    let second = h
        .step(vec![activity_completed(1, "47"), activity_completed(2, "12")])
        .unwrap();
    assert_finished(&second);
    assert_eq!(second.commands, vec![complete("59")]);
    assert_eq!(
        h.kinds(),
        vec![
            "WorkflowTaskStarted",
            "ExecutionStarted",
            "ActivityScheduled",
            "ActivityScheduled",
            "WorkflowTaskStarted",
            "ActivityCompleted",
            "ActivityCompleted",
            "ExecutionCompleted",
        ]
    );
    let seqs: Vec<u64> = h.history.iter().map(|e| e.sequence_id).collect();
    assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
}

#[test]
fn completed_history_replays_to_the_same_terminal_event() {
    let mut h = Harness::new(executor(registry()));
    h.step(vec![started("TwoActivities", &[PERSON_JOHN])]).unwrap();
    h.step(vec![activity_completed(1, "47"), activity_completed(2, "12")])
        .unwrap();

    let report = uncached_executor(registry())
        .replay_history(&instance(), h.history.clone())
        .unwrap();
    assert_eq!(report.events_replayed, h.history.len());
    assert_eq!(report.state, durable_workflows::WorkflowState::Finished);
    assert_eq!(
        report.terminal,
        Some(EventKind::ExecutionCompleted {
            result: Some("59".to_string()),
            error: None
        })
    );
}

#[test]
fn replay_from_scratch_only_emits_the_new_decision() {
    let mut first = Harness::new(executor(registry()));
    first.step(vec![started("TwoActivities", &[PERSON_JOHN])]).unwrap();

    // A different worker with no cached state picks up the next task.
    let mut second = Harness::new(uncached_executor(registry()));
    second.history = first.history.clone();
    let result = second
        .step(vec![activity_completed(1, "40"), activity_completed(2, "2")])
        .unwrap();

    assert_eq!(result.commands, vec![complete("42")]);
    let metrics = second.executor.metrics();
    assert_eq!(metrics.events_replayed, 4);
    assert_eq!(metrics.cache_misses, 1);
}

#[test]
fn completions_in_the_start_task_settle_once_scheduled() {
    let mut h = Harness::new(executor(registry()));
    let r = h
        .step(vec![
            started("TwoActivities", &[PERSON_JOHN]),
            activity_completed(1, "47"),
            activity_completed(2, "12"),
        ])
        .unwrap();
    assert_finished(&r);
    assert_eq!(
        r.commands,
        vec![
            schedule(1, "Activity1", &["35", "12"]),
            schedule(2, "Activity2", &[]),
            complete("59"),
        ]
    );
    assert_eq!(
        h.kinds(),
        vec![
            "WorkflowTaskStarted",
            "ExecutionStarted",
            "ActivityCompleted",
            "ActivityCompleted",
            "ActivityScheduled",
            "ActivityScheduled",
            "ExecutionCompleted",
        ]
    );

    let report = uncached_executor(registry())
        .replay_history(&instance(), h.history.clone())
        .unwrap();
    assert_eq!(report.state, durable_workflows::WorkflowState::Finished);
    assert!(report.commands.is_empty());
}

#[test]
fn input_only_history_reissues_scheduling_commands() {
    let history = sequenced(vec![
        started("TwoActivities", &[PERSON_JOHN]),
        activity_completed(1, "47"),
        activity_completed(2, "12"),
    ]);
    let report = uncached_executor(registry())
        .replay_history(&instance(), history)
        .unwrap();
    assert_eq!(report.events_replayed, 3);
    assert_eq!(
        report.commands,
        vec![
            schedule(1, "Activity1", &["35", "12"]),
            schedule(2, "Activity2", &[]),
            complete("59"),
        ]
    );
    assert_eq!(report.state, durable_workflows::WorkflowState::Finished);
    assert_eq!(
        report.terminal,
        Some(EventKind::ExecutionCompleted {
            result: Some("59".to_string()),
            error: None
        })
    );
}

#[test]
fn input_only_history_with_a_stray_completion_is_nondeterministic() {
    let history = sequenced(vec![
        started("TwoActivities", &[PERSON_JOHN]),
        activity_completed(1, "47"),
        activity_completed(5, "12"),
    ]);
    let err = uncached_executor(registry())
        .replay_history(&instance(), history)
        .unwrap_err();
    assert!(err.is_nondeterminism(), "unexpected error: {err}");
}

#[test]
fn sequential_steps_run_one_at_a_time() {
    let mut h = Harness::new(executor(registry()));
    let r = h.step(vec![started("Sequence", &[r#"["a","b","c"]"#])]).unwrap();
    assert_eq!(r.commands, vec![schedule(1, "Step", &["\"a\""])]);

    let r = h.step(vec![activity_completed(1, "\"A\"")]).unwrap();
    assert_eq!(r.commands, vec![schedule(2, "Step", &["\"b\""])]);

    let r = h.step(vec![activity_completed(2, "\"B\"")]).unwrap();
    assert_eq!(r.commands, vec![schedule(3, "Step", &["\"c\""])]);

    let r = h.step(vec![activity_completed(3, "\"C\"")]).unwrap();
    assert_eq!(r.commands, vec![complete(r#"["A","B","C"]"#)]);
}

#[test]
fn cached_and_uncached_executors_write_identical_histories() {
    let tasks = vec![
        vec![started("Sequence", &[r#"["x","y"]"#])],
        vec![activity_completed(1, "\"X\"")],
        vec![activity_completed(2, "\"Y\"")],
    ];

    let mut cached = Harness::new(executor(registry()));
    let mut uncached = Harness::new(uncached_executor(registry()));
    for task in tasks {
        let a = cached.step(task.clone()).unwrap();
        let b = uncached.step(task).unwrap();
        assert_eq!(a, b);
    }
    assert_eq!(cached.history, uncached.history);
    assert_eq!(cached.executor.metrics().cache_hits, 2);
    assert_eq!(uncached.executor.metrics().cache_hits, 0);
}

async fn work_then_pause(ctx: WorkflowContext, _input: ()) -> Result<u64, WorkflowError> {
    let work = ctx.execute_activity::<i64>("Work", (1,));
    let deadline = ctx.schedule_timer(Duration::from_secs(5));
    work.get(&ctx).await?;
    deadline.get(&ctx).await?;
    ctx.sleep(Duration::from_secs(1)).await?;
    Ok(ctx.now_ms())
}

#[test]
fn logical_time_ignores_arrival_order_inside_a_batch() {
    let registry = || {
        WorkflowRegistry::builder()
            .register_typed("WorkThenPause", work_then_pause)
            .build()
            .unwrap()
    };
    let fired = START_MS + 5_000;
    let batches = [
        vec![timer_fired(2, fired), activity_completed(1, "2")],
        vec![activity_completed(1, "2"), timer_fired(2, fired)],
    ];
    for batch in batches {
        let mut h = Harness::new(executor(registry()));
        h.step(vec![started("WorkThenPause", &[])]).unwrap();
        let r = h.step(batch).unwrap();
        assert_eq!(
            r.commands,
            vec![Command::ScheduleTimer {
                id: 3,
                fire_at_ms: fired + 1_000
            }]
        );
    }
}

#[test]
fn timers_use_logical_time() {
    let mut h = Harness::new(executor(registry()));
    let r = h.step(vec![started("Nap", &[])]).unwrap();
    assert_eq!(
        r.commands,
        vec![Command::ScheduleTimer {
            id: 1,
            fire_at_ms: START_MS + 5_000
        }]
    );

    let r = h.step(vec![timer_fired(1, START_MS + 5_000)]).unwrap();
    assert_eq!(r.commands, vec![complete("[1000,6000]")]);
}

#[test]
fn spawned_units_are_driven_in_creation_order() {
    let mut h = Harness::new(executor(registry()));
    let r = h.step(vec![started("FanOut", &["[1,2,3]"])]).unwrap();
    assert_eq!(
        r.commands,
        vec![
            schedule(1, "Work", &["1"]),
            schedule(2, "Work", &["2"]),
            schedule(3, "Work", &["3"]),
        ]
    );

    // Completions arrive in reverse, but timers are started unit by unit.
    let r = h
        .step(vec![
            activity_completed(3, "6"),
            activity_completed(2, "4"),
            activity_completed(1, "2"),
        ])
        .unwrap();
    let fire_at_ms = START_MS + 1_000;
    assert_eq!(
        r.commands,
        vec![
            Command::ScheduleTimer { id: 4, fire_at_ms },
            Command::ScheduleTimer { id: 5, fire_at_ms },
            Command::ScheduleTimer { id: 6, fire_at_ms },
        ]
    );

    let r = h
        .step(vec![
            timer_fired(6, fire_at_ms),
            timer_fired(5, fire_at_ms),
            timer_fired(4, fire_at_ms),
        ])
        .unwrap();
    assert_eq!(r.commands, vec![complete("12")]);

    let report = uncached_executor(registry())
        .replay_history(&instance(), h.history.clone())
        .unwrap();
    assert_eq!(report.state, durable_workflows::WorkflowState::Finished);
}

#[test]
fn signals_resolve_subscriptions_in_order() {
    let mut h = Harness::new(executor(registry()));
    let r = h.step(vec![started("Collect", &["2"])]).unwrap();
    assert_eq!(
        r.commands,
        vec![Command::WaitSignal {
            id: 1,
            name: "item".to_string()
        }]
    );

    let r = h
        .step(vec![signal("item", "\"first\""), signal("item", "\"second\"")])
        .unwrap();
    assert_eq!(
        r.commands,
        vec![
            Command::WaitSignal {
                id: 2,
                name: "item".to_string()
            },
            complete(r#"["first","second"]"#),
        ]
    );

    let report = uncached_executor(registry())
        .replay_history(&instance(), h.history.clone())
        .unwrap();
    assert!(report.terminal.is_some());
}

async fn late_listener(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    let prefix: String = ctx.execute_activity("Prefix", ()).get(&ctx).await?;
    let name: String = ctx.wait_signal("name").get(&ctx).await?;
    Ok(format!("{prefix} {name}"))
}

#[test]
fn signal_sent_before_subscription_is_buffered() {
    let registry = WorkflowRegistry::builder()
        .register_typed("LateListener", late_listener)
        .build()
        .unwrap();
    let mut h = Harness::new(executor(registry.clone()));
    h.step(vec![started("LateListener", &[])]).unwrap();

    let r = h.step(vec![signal("name", "\"world\"")]).unwrap();
    assert!(r.commands.is_empty());

    let r = h.step(vec![activity_completed(1, "\"hello\"")]).unwrap();
    assert_eq!(
        r.commands,
        vec![
            Command::WaitSignal {
                id: 2,
                name: "name".to_string()
            },
            complete("\"hello world\""),
        ]
    );

    let report = uncached_executor(registry)
        .replay_history(&instance(), h.history.clone())
        .unwrap();
    assert_eq!(
        report.terminal,
        Some(EventKind::ExecutionCompleted {
            result: Some("\"hello world\"".to_string()),
            error: None
        })
    );
}

#[test]
fn approval_signal_wins_over_deadline() {
    let mut h = Harness::new(executor(registry()));
    let r = h.step(vec![started("Approval", &[])]).unwrap();
    assert_eq!(
        r.commands,
        vec![
            Command::WaitSignal {
                id: 1,
                name: "approve".to_string()
            },
            Command::ScheduleTimer {
                id: 2,
                fire_at_ms: START_MS + 3_600_000
            },
        ]
    );
    let r = h.step(vec![signal("approve", "true")]).unwrap();
    assert_eq!(r.commands, vec![complete("\"approved\"")]);
}

#[test]
fn approval_deadline_expires() {
    let mut h = Harness::new(executor(registry()));
    h.step(vec![started("Approval", &[])]).unwrap();
    let r = h.step(vec![timer_fired(2, START_MS + 3_600_000)]).unwrap();
    assert_eq!(r.commands, vec![complete("\"expired\"")]);
}

#[test]
fn activity_failure_completes_with_error() {
    let mut h = Harness::new(executor(registry()));
    h.step(vec![started("Fragile", &[])]).unwrap();
    let r = h.step(vec![activity_failed(1, "boom")]).unwrap();
    assert_finished(&r);
    assert_eq!(r.commands, vec![failed("activity 'MayFail' failed: boom")]);
}

#[test]
fn activity_failure_can_be_compensated() {
    let mut h = Harness::new(executor(registry()));
    h.step(vec![started("Compensating", &[])]).unwrap();
    let r = h.step(vec![activity_failed(1, "card declined")]).unwrap();
    assert_eq!(r.commands, vec![schedule(2, "Refund", &[])]);
    let r = h.step(vec![activity_completed(2, "\"ok\"")]).unwrap();
    assert_eq!(r.commands, vec![complete("\"refunded\"")]);
}

#[test]
fn replaying_flag_is_set_only_while_rebuilding_state() {
    let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
    let observed = seen.clone();
    let registry = WorkflowRegistry::builder()
        .register_typed("Observe", move |ctx: WorkflowContext, _input: ()| {
            let seen = observed.clone();
            async move {
                seen.lock().unwrap().push(ctx.is_replaying());
                ctx.sleep(Duration::from_secs(1)).await?;
                seen.lock().unwrap().push(ctx.is_replaying());
                Ok::<_, WorkflowError>(())
            }
        })
        .build()
        .unwrap();

    let mut h = Harness::new(uncached_executor(registry));
    h.step(vec![started("Observe", &[])]).unwrap();
    h.step(vec![timer_fired(1, START_MS + 1_000)]).unwrap();

    // Live first run, then a replayed start followed by the live resume.
    assert_eq!(*seen.lock().unwrap(), vec![false, true, false]);
}

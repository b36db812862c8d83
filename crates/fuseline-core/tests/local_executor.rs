// End-to-end scenarios for the local in-process executor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fuseline_core::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Records `<label>:start` / `<label>:end` markers with timestamps.
#[derive(Clone, Default)]
struct Timeline {
    entries: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Timeline {
    fn mark(&self, label: &str) {
        self.entries.lock().push((label.to_string(), Instant::now()));
    }

    fn at(&self, label: &str) -> Instant {
        self.entries
            .lock()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, t)| *t)
            .unwrap_or_else(|| panic!("no timeline entry {label}"))
    }

    fn timed_step(&self, label: &str, sleep: Duration, result: Value) -> Arc<FnStep> {
        let timeline = self.clone();
        let label_owned = label.to_string();
        FnStep::new(label, move |_| {
            let timeline = timeline.clone();
            let label = label_owned.clone();
            let result = result.clone();
            async move {
                timeline.mark(&format!("{label}:start"));
                tokio::time::sleep(sleep).await;
                timeline.mark(&format!("{label}:end"));
                Ok(result)
            }
        })
    }
}

#[tokio::test]
async fn linear_chain_runs_in_order() {
    let timeline = Timeline::default();
    let mut builder = WorkflowBuilder::new("chain");
    let a = builder.add_step(StepSpec::new(timeline.timed_step(
        "A",
        Duration::from_millis(50),
        json!(null),
    )));
    let b = builder.add_step(StepSpec::new(timeline.timed_step(
        "B",
        Duration::from_millis(50),
        json!(null),
    )));
    let c = builder.add_step(StepSpec::new(timeline.timed_step(
        "C",
        Duration::from_millis(50),
        json!("SUCCESS"),
    )));
    builder.link(a, b);
    builder.link(b, c);
    builder.output(c);
    let mut workflow = builder.build().unwrap();

    let result = workflow.run(Map::new()).await;

    assert_eq!(result, Some(json!("SUCCESS")));
    assert_eq!(workflow.state(), Status::Succeeded);
    assert!(timeline.at("A:end") <= timeline.at("B:start"));
    assert!(timeline.at("B:end") <= timeline.at("C:start"));
}

#[tokio::test]
async fn fan_out_runs_concurrently_and_joins_once() {
    let timeline = Timeline::default();
    let tracer = Arc::new(MemoryTracer::new());

    let mut builder = WorkflowBuilder::new("fanout");
    let start = builder.add_step(StepSpec::new(timeline.timed_step(
        "Start",
        Duration::from_millis(50),
        json!(null),
    )));
    let p1 = builder.add_step(StepSpec::new(timeline.timed_step(
        "P1",
        Duration::from_millis(100),
        json!(1),
    )));
    let p2 = builder.add_step(StepSpec::new(timeline.timed_step(
        "P2",
        Duration::from_millis(50),
        json!(2),
    )));
    let join = builder.add_step(StepSpec::new(timeline.timed_step(
        "Join",
        Duration::from_millis(50),
        json!(["op1", "op2"]),
    )));
    builder.link(start, p1);
    builder.link(start, p2);
    builder.link(p1, join);
    builder.link(p2, join);
    builder.output(join);
    let mut workflow = builder.build().unwrap();
    workflow.set_tracer(tracer.clone());

    let result = workflow
        .run_with(&LocalExecutor::new(2), Map::new())
        .await;

    assert_eq!(result, Some(json!(["op1", "op2"])));
    assert!(timeline.at("Start:end") <= timeline.at("P1:start"));
    assert!(timeline.at("Start:end") <= timeline.at("P2:start"));
    // The branches overlap: P2 starts before P1 finishes.
    assert!(timeline.at("P2:start") < timeline.at("P1:end"));
    let join_start = timeline.at("Join:start");
    assert!(timeline.at("P1:end") <= join_start);
    assert!(timeline.at("P2:end") <= join_start);

    let join_started = tracer
        .events()
        .iter()
        .filter(|e| e.event == "step_started" && e.step.as_deref() == Some("Join"))
        .count();
    let join_finished = tracer
        .events()
        .iter()
        .filter(|e| e.event == "step_finished" && e.step.as_deref() == Some("Join"))
        .count();
    assert_eq!(join_started, 1);
    assert_eq!(join_finished, 1);
}

#[tokio::test]
async fn or_join_executes_once_with_winner_payload() {
    let triggers = Arc::new(AtomicU32::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut builder = WorkflowBuilder::new("race");
    let p1 = builder.add_step(StepSpec::new(FnStep::new("P1", |_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!("p1"))
    })));
    let p2 = builder.add_step(StepSpec::new(FnStep::new("P2", |_| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!("p2"))
    })));
    let counted = triggers.clone();
    let sink = received.clone();
    let winner = builder.add_step(
        StepSpec::new(FnStep::new("RaceWinner", move |args: StepArgs| {
            let counted = counted.clone();
            let sink = sink.clone();
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                sink.lock().push(value);
                Ok(json!(null))
            }
        }))
        .param(ParamSpec::or_dep("value", [p1, p2])),
    );
    builder.output(winner);
    let mut workflow = builder.build().unwrap();

    workflow
        .run_with(&LocalExecutor::new(2), Map::new())
        .await
        .unwrap();

    assert_eq!(triggers.load(Ordering::SeqCst), 1);
    assert_eq!(received.lock().as_slice(), &[json!("p1")]);
    assert_eq!(workflow.state(), Status::Succeeded);
}

#[tokio::test]
async fn condition_skips_step_with_nil_result() {
    let b1_runs = Arc::new(AtomicU32::new(0));
    let b2_runs = Arc::new(AtomicU32::new(0));
    let tracer = Arc::new(MemoryTracer::new());

    let mut builder = WorkflowBuilder::new("conditional");
    let decide = builder.add_step(
        StepSpec::new(FnStep::new("DecideTask", |args: StepArgs| {
            let flag = args.get("flag").cloned().unwrap_or(json!(false));
            async move { Ok(flag) }
        }))
        .param(ParamSpec::plain("flag")),
    );
    let b1_counter = b1_runs.clone();
    let b1 = builder.add_step(
        StepSpec::new(FnStep::new("B1", move |_| {
            let counter = b1_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("b1"))
            }
        }))
        .param(
            ParamSpec::dep("flag", decide)
                .with_condition(|value, _| value.as_bool().unwrap_or(false)),
        ),
    );
    let b2_counter = b2_runs.clone();
    let b2 = builder.add_step(
        StepSpec::new(FnStep::new("B2", move |_| {
            let counter = b2_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("b2"))
            }
        }))
        .param(
            ParamSpec::dep("flag", decide)
                .with_condition(|value, _| !value.as_bool().unwrap_or(false)),
        ),
    );
    builder.output(b1);
    builder.output(b2);
    let mut workflow = builder.build().unwrap();
    workflow.set_tracer(tracer.clone());

    let result = workflow.run(inputs(&[("flag", json!(true))])).await;

    assert_eq!(result, Some(json!(["b1", null])));
    assert_eq!(b1_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b2_runs.load(Ordering::SeqCst), 0);
    assert_eq!(workflow.step_state(b1), Status::Succeeded);
    assert_eq!(workflow.step_state(b2), Status::Skipped);

    let checks: Vec<bool> = tracer
        .events()
        .iter()
        .filter(|e| e.event == "condition_check")
        .map(|e| e.data["passed"].as_bool().unwrap())
        .collect();
    assert_eq!(checks.len(), 2);
    assert!(checks.contains(&true));
    assert!(checks.contains(&false));
}

#[tokio::test]
async fn retry_policy_recovers_failing_step() {
    let attempts = Arc::new(AtomicU32::new(0));
    let downstream = Arc::new(AtomicU32::new(0));

    let mut builder = WorkflowBuilder::new("retry");
    let counter = attempts.clone();
    let failing = builder.add_step(
        StepSpec::new(FnStep::new("FailingTask", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StepError::failed("first attempt fails"))
                } else {
                    Ok(json!(null))
                }
            }
        }))
        .policy(Arc::new(RetryPolicy::new(2))),
    );
    let ran = downstream.clone();
    let simple = builder.add_step(StepSpec::new(FnStep::new("SimpleTask", move |_| {
        let ran = ran.clone();
        async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    })));
    builder.link(failing, simple);
    builder.output(simple);
    let mut workflow = builder.build().unwrap();

    let result = workflow.run(Map::new()).await;

    assert!(result.is_some());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(downstream.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.step_state(failing), Status::Succeeded);
    assert_eq!(workflow.step_state(simple), Status::Succeeded);
}

#[tokio::test]
async fn failure_cancels_remaining_pending_steps() {
    let tracer = Arc::new(MemoryTracer::new());

    let mut builder = WorkflowBuilder::new("failing");
    let boom = builder.add_step(StepSpec::new(FnStep::new("Boom", |_| async {
        Err(StepError::failed("boom"))
    })));
    let never = builder.add_step(StepSpec::new(FnStep::new("Never", |_| async {
        Ok(json!(null))
    })));
    builder.link(boom, never);
    builder.output(never);
    let mut workflow = builder.build().unwrap();
    workflow.set_tracer(tracer.clone());

    let result = workflow.run(Map::new()).await;

    assert_eq!(result, None);
    assert_eq!(workflow.state(), Status::Failed);
    assert_eq!(workflow.step_state(boom), Status::Failed);
    assert_eq!(workflow.step_state(never), Status::Cancelled);
    assert_eq!(tracer.count("step_failed"), 1);
    assert_eq!(tracer.count("step_cancelled"), 1);
    assert_eq!(tracer.count("workflow_finished"), 1);
}

#[tokio::test]
async fn single_step_workflow_runs() {
    let mut builder = WorkflowBuilder::new("single");
    let only = builder.add_step(StepSpec::new(FnStep::new("Only", |_| async {
        Ok(json!("done"))
    })));
    builder.output(only);
    let mut workflow = builder.build().unwrap();

    // Empty inputs, no predecessors, no successors.
    assert_eq!(workflow.run(Map::new()).await, Some(json!("done")));
    assert_eq!(workflow.state(), Status::Succeeded);
}

#[tokio::test]
async fn or_group_of_one_acts_like_plain_dependency() {
    let mut builder = WorkflowBuilder::new("solo-group");
    let producer = builder.add_step(StepSpec::new(FnStep::new("Producer", |_| async {
        Ok(json!(7))
    })));
    let consumer = builder.add_step(
        StepSpec::new(FnStep::new("Consumer", |args: StepArgs| {
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            async move { Ok(value) }
        }))
        .param(ParamSpec::or_dep("value", [producer])),
    );
    builder.output(consumer);
    let mut workflow = builder.build().unwrap();

    assert_eq!(workflow.run(Map::new()).await, Some(json!(7)));
    assert_eq!(workflow.step_state(consumer), Status::Succeeded);
}

#[tokio::test]
async fn unmatched_action_ends_branch() {
    let ran = Arc::new(AtomicU32::new(0));

    let mut builder = WorkflowBuilder::new("branching");
    let decide = builder.add_step(StepSpec::new(FnStep::new("Decide", |_| async {
        Ok(json!("unknown-action"))
    })));
    let counter = ran.clone();
    let target = builder.add_step(StepSpec::new(FnStep::new("Target", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    })));
    builder.link_action(decide, "known", target);
    builder.output(target);
    let mut workflow = builder.build().unwrap();

    let result = workflow.run(Map::new()).await;

    // The branch simply ends: no successor ran, the workflow still finishes.
    assert!(result.is_some());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(workflow.step_state(target), Status::Pending);
}

// Broker scheduling semantics against in-memory runtime storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fuseline_broker::{Broker, BrokerError, StepReport};
use fuseline_core::prelude::*;
use fuseline_storage::{MemoryRuntimeStorage, RuntimeStorage};
use serde_json::{json, Map, Value};

fn noop(label: &str) -> Arc<FnStep> {
    FnStep::new(label, |_| async { Ok(json!(null)) })
}

/// step0 -> step1
fn linear_schema() -> WorkflowSchema {
    let mut builder = WorkflowBuilder::new("linear");
    let a = builder.add_step(StepSpec::new(noop("A")));
    let b = builder.add_step(StepSpec::new(noop("B")));
    builder.link(a, b);
    builder.output(b);
    builder.build().unwrap().to_schema()
}

/// step0, step1 feed step2 through one OR-group.
fn race_schema() -> WorkflowSchema {
    let mut builder = WorkflowBuilder::new("race");
    let p1 = builder.add_step(StepSpec::new(noop("P1")));
    let p2 = builder.add_step(StepSpec::new(noop("P2")));
    let winner = builder
        .add_step(StepSpec::new(noop("Winner")).param(ParamSpec::or_dep("value", [p1, p2])));
    builder.output(winner);
    builder.build().unwrap().to_schema()
}

fn broker() -> (Broker, Arc<MemoryRuntimeStorage>) {
    let store = Arc::new(MemoryRuntimeStorage::new());
    (Broker::new(store.clone()), store)
}

fn report(wf: &str, inst: &str, step: &str, state: Status, result: Value) -> StepReport {
    StepReport {
        workflow_id: wf.to_string(),
        instance_id: inst.to_string(),
        step_name: step.to_string(),
        state,
        result,
    }
}

#[tokio::test]
async fn lease_lifecycle_and_finalization() {
    let (broker, store) = broker();
    let schema = linear_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&worker).await.unwrap().expect("root step");
    assert_eq!(assignment.step_name, "step0");
    assert_eq!(
        (assignment.expires_at - assignment.assigned_at).num_seconds(),
        60
    );
    let lease = store
        .get_assignment("linear", &instance, "step0")
        .await
        .unwrap()
        .expect("lease recorded");
    assert_eq!(lease.worker_id, worker);
    assert_eq!(
        store.get_state("linear", &instance, "step0").await.unwrap(),
        Some(Status::Running)
    );

    broker
        .report_step(
            &worker,
            report("linear", &instance, "step0", Status::Succeeded, json!(1)),
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_assignment("linear", &instance, "step0").await.unwrap(),
        None
    );

    // The successor carries the predecessor's result in its payload.
    let next = broker.get_step(&worker).await.unwrap().expect("successor");
    assert_eq!(next.step_name, "step1");
    assert_eq!(next.payload.results.get("step0"), Some(&json!(1)));

    broker
        .report_step(
            &worker,
            report("linear", &instance, "step1", Status::Succeeded, json!(2)),
        )
        .await
        .unwrap();
    assert!(store.is_finished("linear", &instance).await.unwrap());
    assert_eq!(broker.get_step(&worker).await.unwrap(), None);
}

#[tokio::test]
async fn duplicate_report_is_a_no_op() {
    let (broker, store) = broker();
    let schema = linear_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&worker).await.unwrap().unwrap();
    let done = report(
        "linear",
        &instance,
        &assignment.step_name,
        Status::Succeeded,
        json!(null),
    );
    broker.report_step(&worker, done.clone()).await.unwrap();
    // Re-reporting after the lease is cleared neither duplicates the
    // successor in the queue nor disturbs stored state.
    broker.report_step(&worker, done).await.unwrap();

    assert_eq!(store.queue_size("linear", &instance).await.unwrap(), 1);
    let next = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(next.step_name, "step1");
    assert_eq!(broker.get_step(&worker).await.unwrap(), None);
}

#[tokio::test]
async fn non_leaseholder_report_is_ignored() {
    let (broker, store) = broker();
    let schema = linear_schema();
    let holder = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let intruder = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&holder).await.unwrap().unwrap();
    broker
        .report_step(
            &intruder,
            report(
                "linear",
                &instance,
                &assignment.step_name,
                Status::Succeeded,
                json!(null),
            ),
        )
        .await
        .unwrap();

    // The lease and the running state are untouched.
    let lease = store
        .get_assignment("linear", &instance, "step0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.worker_id, holder);
    assert_eq!(
        store.get_state("linear", &instance, "step0").await.unwrap(),
        Some(Status::Running)
    );
    assert_eq!(store.queue_size("linear", &instance).await.unwrap(), 0);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_late_report_discarded() {
    let (broker, store) = broker();
    let schema = linear_schema();
    let first = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let second = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&first).await.unwrap().unwrap();
    // Force the lease into the past.
    store
        .assign_step(
            "linear",
            &instance,
            &assignment.step_name,
            &first,
            Utc::now() - chrono::Duration::seconds(1),
        )
        .await
        .unwrap();

    let reclaimed = broker.get_step(&second).await.unwrap().unwrap();
    assert_eq!(reclaimed.step_name, "step0");

    // The original worker's report arrives late and is discarded.
    broker
        .report_step(
            &first,
            report("linear", &instance, "step0", Status::Succeeded, json!("stale")),
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_state("linear", &instance, "step0").await.unwrap(),
        Some(Status::Running)
    );
    assert_eq!(store.get_result("linear", &instance, "step0").await.unwrap(), None);

    broker
        .report_step(
            &second,
            report("linear", &instance, "step0", Status::Succeeded, json!("fresh")),
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_result("linear", &instance, "step0").await.unwrap(),
        Some(json!("fresh"))
    );
}

#[tokio::test]
async fn or_join_enqueues_consumer_exactly_once() {
    let (broker, store) = broker();
    let schema = race_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let p1 = broker.get_step(&worker).await.unwrap().unwrap();
    broker
        .report_step(
            &worker,
            report("race", &instance, &p1.step_name, Status::Succeeded, json!("one")),
        )
        .await
        .unwrap();

    let p2 = broker.get_step(&worker).await.unwrap().unwrap();
    broker
        .report_step(
            &worker,
            report("race", &instance, &p2.step_name, Status::Succeeded, json!("two")),
        )
        .await
        .unwrap();

    // Both completions selected the consumer; the set-backed queue holds it once.
    assert_eq!(store.queue_size("race", &instance).await.unwrap(), 1);
    let winner = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(winner.step_name, "step2");
    assert_eq!(winner.payload.results.len(), 2);
    assert_eq!(broker.get_step(&worker).await.unwrap(), None);
}

#[tokio::test]
async fn result_action_selects_successors() {
    // step0 -"publish"-> step1 ; step0 -default-> step2
    let mut builder = WorkflowBuilder::new("branching");
    let decide = builder.add_step(StepSpec::new(noop("Decide")));
    let publish = builder.add_step(StepSpec::new(noop("Publish")));
    let archive = builder.add_step(StepSpec::new(noop("Archive")));
    builder.link_action(decide, "publish", publish);
    builder.link(decide, archive);
    builder.output(publish);
    builder.output(archive);
    let schema = builder.build().unwrap().to_schema();

    let (broker, store) = broker();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let decide_step = broker.get_step(&worker).await.unwrap().unwrap();
    broker
        .report_step(
            &worker,
            report(
                "branching",
                &instance,
                &decide_step.step_name,
                Status::Succeeded,
                json!("publish"),
            ),
        )
        .await
        .unwrap();

    let next = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(next.step_name, "step1");
    assert_eq!(store.queue_size("branching", &instance).await.unwrap(), 0);
    assert_eq!(
        store.get_state("branching", &instance, "step2").await.unwrap(),
        Some(Status::Pending)
    );
}

#[tokio::test]
async fn unmatched_action_falls_back_to_default() {
    let mut builder = WorkflowBuilder::new("fallback");
    let decide = builder.add_step(StepSpec::new(noop("Decide")));
    let archive = builder.add_step(StepSpec::new(noop("Archive")));
    builder.link(decide, archive);
    builder.output(archive);
    let schema = builder.build().unwrap().to_schema();

    let (broker, _store) = broker();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let decide_step = broker.get_step(&worker).await.unwrap().unwrap();
    broker
        .report_step(
            &worker,
            report(
                "fallback",
                &instance,
                &decide_step.step_name,
                Status::Succeeded,
                json!("no-such-action"),
            ),
        )
        .await
        .unwrap();

    let next = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(next.step_name, "step1");
}

#[tokio::test]
async fn failed_step_cancels_remaining_and_finalizes() {
    let (broker, store) = broker();
    let schema = linear_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&worker).await.unwrap().unwrap();
    broker
        .report_step(
            &worker,
            report(
                "linear",
                &instance,
                &assignment.step_name,
                Status::Failed,
                Value::Null,
            ),
        )
        .await
        .unwrap();

    assert_eq!(
        store.get_state("linear", &instance, "step0").await.unwrap(),
        Some(Status::Failed)
    );
    assert_eq!(
        store.get_state("linear", &instance, "step1").await.unwrap(),
        Some(Status::Cancelled)
    );
    assert!(store.is_finished("linear", &instance).await.unwrap());
    assert_eq!(broker.get_step(&worker).await.unwrap(), None);
}

#[tokio::test]
async fn skipped_step_propagates_along_default() {
    let (broker, store) = broker();
    let schema = linear_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    let instance = broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&worker).await.unwrap().unwrap();
    broker
        .report_step(
            &worker,
            report(
                "linear",
                &instance,
                &assignment.step_name,
                Status::Skipped,
                Value::Null,
            ),
        )
        .await
        .unwrap();

    // The nil result is recorded and the default successor becomes ready.
    assert_eq!(
        store.get_result("linear", &instance, "step0").await.unwrap(),
        Some(Value::Null)
    );
    let next = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(next.step_name, "step1");
    assert_eq!(next.payload.results.get("step0"), Some(&Value::Null));
}

#[tokio::test]
async fn conflicting_schema_is_rejected() {
    let (broker, _store) = broker();
    let schema = linear_schema();
    broker.register_worker(std::slice::from_ref(&schema)).unwrap();

    // Same identity, different structure.
    let mut builder = WorkflowBuilder::new("linear");
    let a = builder.add_step(StepSpec::new(noop("A")));
    builder.output(a);
    let conflicting = builder.build().unwrap().to_schema();

    let err = broker
        .register_worker(std::slice::from_ref(&conflicting))
        .unwrap_err();
    assert!(matches!(err, BrokerError::SchemaMismatch { .. }));
    let err = broker
        .dispatch_workflow(&conflicting, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SchemaMismatch { .. }));
}

#[tokio::test]
async fn dead_workers_are_pruned() {
    let store = Arc::new(MemoryRuntimeStorage::new());
    let broker =
        Broker::new(store).with_worker_ttl(Duration::from_millis(50));
    let schema = linear_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    assert_eq!(broker.list_workers().len(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(broker.list_workers().is_empty());

    // A pruned worker no longer receives assignments.
    broker.dispatch_workflow(&schema, None).await.unwrap();
    assert_eq!(broker.get_step(&worker).await.unwrap(), None);
}

#[tokio::test]
async fn timeout_policy_extends_lease() {
    let mut builder = WorkflowBuilder::new("slow");
    let step = builder.add_step(
        StepSpec::new(noop("Slow"))
            .policy(Arc::new(TimeoutPolicy::new(Duration::from_secs(30)))),
    );
    builder.output(step);
    let schema = builder.build().unwrap().to_schema();

    let (broker, _store) = broker();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();
    broker.dispatch_workflow(&schema, None).await.unwrap();

    let assignment = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(
        (assignment.expires_at - assignment.assigned_at).num_seconds(),
        90
    );
}

#[tokio::test]
async fn workflow_inputs_reach_the_payload() {
    let (broker, _store) = broker();
    let schema = linear_schema();
    let worker = broker.register_worker(std::slice::from_ref(&schema)).unwrap();

    let mut inputs = Map::new();
    inputs.insert("target".to_string(), json!("prod"));
    broker
        .dispatch_workflow(&schema, Some(inputs.clone()))
        .await
        .unwrap();

    let assignment = broker.get_step(&worker).await.unwrap().unwrap();
    assert_eq!(assignment.payload.workflow_inputs, inputs);
}

#[tokio::test]
async fn repository_catalogue_round_trip() {
    let (broker, _store) = broker();
    let repo = fuseline_broker::RepositoryInfo {
        name: "etl".to_string(),
        url: "https://example.com/etl.git".to_string(),
        workflows: vec!["registry:nightly".to_string()],
        credentials: Default::default(),
    };
    broker.register_repository(repo.clone());

    assert_eq!(broker.get_repository("etl"), Some(repo.clone()));
    assert_eq!(broker.get_repository("missing"), None);
    assert_eq!(broker.list_repositories(1, 50), vec![repo]);
    assert!(broker.list_repositories(2, 50).is_empty());

    let workflows = broker.list_workflows();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].repository, "etl");
    assert_eq!(workflows[0].workflow, "registry:nightly");
}

//! Step execution and the local in-process executor
//!
//! The policy-chain attempt loop and dependency resolution here are shared
//! by both scheduling modes: the local executor below drives whole runs in
//! process, while workers call [`Workflow::execute_step`] for single leased
//! steps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::StepError;
use crate::graph::{DepSource, StepId, Workflow};
use crate::policy::{FailureDecision, StepContext, StepFuture, StepPolicy};
use crate::status::Status;
use crate::step::{StepArgs, StepHandler};
use crate::trace::{BoundTracer, TraceEvent, Tracer};

/// Result of one step execution.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub value: Value,
    /// Set when a condition predicate vetoed the invocation or a policy
    /// decided to skip; the value is nil and downstream propagation follows
    /// the `default` action.
    pub skipped: bool,
}

impl StepOutcome {
    fn skipped() -> Self {
        Self {
            value: Value::Null,
            skipped: true,
        }
    }
}

/// Bounded scheduler for driver-mode runs without a broker.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    workers: usize,
}

impl LocalExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Workflow {
    /// Execute one step: resolve typed dependencies from `shared`, consult
    /// condition predicates, merge plain parameters from `inputs` and invoke
    /// the handler through the policy chain.
    ///
    /// `or_triggered` records which member won each OR-group; executions
    /// without that bookkeeping (a worker processing a leased step) fall
    /// back to the first member with a value in `shared`.
    pub async fn execute_step(
        &self,
        id: StepId,
        shared: &HashMap<StepId, Value>,
        or_triggered: &HashMap<(StepId, String), StepId>,
        inputs: &Map<String, Value>,
        tracer: Option<&dyn Tracer>,
    ) -> Result<StepOutcome, StepError> {
        let node = self.step(id);
        let mut values = Map::new();
        for dep in node.deps() {
            let source = match &dep.source {
                DepSource::Single(producer) => *producer,
                DepSource::Group(members) => {
                    let first = members
                        .first()
                        .copied()
                        .ok_or_else(|| StepError::MissingDependency(dep.param.clone()))?;
                    or_triggered
                        .get(&(id, dep.param.clone()))
                        .copied()
                        .or_else(|| members.iter().copied().find(|m| shared.contains_key(m)))
                        .unwrap_or(first)
                }
            };
            let value = shared.get(&source).cloned().unwrap_or(Value::Null);
            if let Some(condition) = &dep.condition {
                let passed = condition(&value, self.step(source).name());
                if let Some(tracer) = tracer {
                    tracer.record(
                        TraceEvent::new("condition_check")
                            .with_step(node.label())
                            .with_field("dependency", Value::String(dep.param.clone()))
                            .with_field("value", value.clone())
                            .with_field("passed", Value::Bool(passed)),
                    );
                }
                if !passed {
                    return Ok(StepOutcome::skipped());
                }
            }
            values.insert(dep.param.clone(), value);
        }
        for name in node.plain_params() {
            if let Some(value) = inputs.get(name) {
                values
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        let policies: Vec<Arc<dyn StepPolicy>> = self
            .step_policies()
            .iter()
            .chain(node.policies().iter())
            .cloned()
            .collect();

        run_attempts(
            node.name(),
            node.label(),
            &policies,
            node.handler().clone(),
            StepArgs::new(values),
        )
        .await
    }

    /// Run locally with a single worker. Returns `None` on failure.
    pub async fn run(&mut self, inputs: Map<String, Value>) -> Option<Value> {
        self.run_with(&LocalExecutor::default(), inputs).await
    }

    /// Run locally with `executor`'s worker pool.
    ///
    /// On failure the workflow state becomes [`Status::Failed`], remaining
    /// pending steps become [`Status::Cancelled`] and `None` is returned.
    /// On success the single declared output's value is returned, or an
    /// array of output values when more than one is declared.
    pub async fn run_with(
        &mut self,
        executor: &LocalExecutor,
        inputs: Map<String, Value>,
    ) -> Option<Value> {
        let instance_id = Uuid::new_v4().simple().to_string();
        let tracer = self.tracer().map(|t| {
            BoundTracer::new(t.clone(), self.workflow_id().to_string(), instance_id.clone())
        });
        if let Some(t) = &tracer {
            t.record(TraceEvent::new("workflow_started"));
        }
        self.state = Status::Running;
        for policy in self.workflow_policies() {
            policy.on_workflow_start(self.workflow_id());
        }

        let outcome = Drive::new(self, &inputs, tracer.as_ref())
            .run(executor.workers)
            .await;

        match outcome.error {
            None => {
                self.state = Status::Succeeded;
                self.step_states = outcome.states;
                if let Some(t) = &tracer {
                    t.record(TraceEvent::new("workflow_finished"));
                }
                let result = if self.outputs().len() == 1 {
                    outcome
                        .shared
                        .get(&self.outputs()[0])
                        .cloned()
                        .unwrap_or(outcome.last)
                } else {
                    Value::Array(
                        self.outputs()
                            .iter()
                            .map(|o| outcome.shared.get(o).cloned().unwrap_or(Value::Null))
                            .collect(),
                    )
                };
                for policy in self.workflow_policies() {
                    policy.on_workflow_finished(self.workflow_id(), Some(&result));
                }
                Some(result)
            }
            Some(_) => {
                self.state = Status::Failed;
                let mut states = outcome.states;
                for (i, state) in states.iter_mut().enumerate() {
                    if *state == Status::Pending {
                        *state = Status::Cancelled;
                        if let Some(t) = &tracer {
                            t.record(
                                TraceEvent::new("step_cancelled")
                                    .with_step(self.steps()[i].label()),
                            );
                        }
                    }
                }
                self.step_states = states;
                if let Some(t) = &tracer {
                    t.record(TraceEvent::new("workflow_finished"));
                }
                for policy in self.workflow_policies() {
                    policy.on_workflow_finished(self.workflow_id(), None);
                }
                None
            }
        }
    }
}

/// Drive the policy-wrapped attempt loop for one step invocation.
pub(crate) async fn run_attempts(
    name: &str,
    label: &str,
    policies: &[Arc<dyn StepPolicy>],
    handler: Arc<dyn StepHandler>,
    args: StepArgs,
) -> Result<StepOutcome, StepError> {
    {
        let ctx = StepContext {
            name,
            label,
            attempt: 0,
        };
        for policy in policies {
            policy.on_start(&ctx);
        }
    }

    let mut attempt: u32 = 0;
    loop {
        let ctx = StepContext {
            name,
            label,
            attempt,
        };
        let handler = handler.clone();
        let args = args.clone();
        let mut call: StepFuture<'_> = Box::pin(async move { handler.run(args).await });
        for policy in policies.iter().rev() {
            call = policy.wrap(&ctx, call);
        }
        match call.await {
            Ok(value) => {
                for policy in policies {
                    policy.on_success(&ctx, &value);
                }
                return Ok(StepOutcome {
                    value,
                    skipped: false,
                });
            }
            Err(error) => {
                let decision = policies
                    .iter()
                    .find_map(|p| p.on_failure(&ctx, &error, attempt));
                match decision {
                    Some(FailureDecision::Retry { delay }) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        attempt += 1;
                    }
                    Some(FailureDecision::Skip) => return Ok(StepOutcome::skipped()),
                    _ => return Err(error),
                }
            }
        }
    }
}

struct DriveOutcome {
    states: Vec<Status>,
    shared: HashMap<StepId, Value>,
    last: Value,
    error: Option<StepError>,
}

struct Drive<'a> {
    wf: &'a Workflow,
    inputs: &'a Map<String, Value>,
    tracer: Option<&'a BoundTracer>,
    states: Vec<Status>,
    shared: HashMap<StepId, Value>,
    or_triggered: HashMap<(StepId, String), StepId>,
    or_remaining: HashSet<(StepId, String)>,
    // Signed: a late OR-group member still decrements its consumer after
    // the group has already been won.
    indegree: Vec<isize>,
    ready: Vec<StepId>,
    last: Value,
}

impl<'a> Drive<'a> {
    fn new(
        wf: &'a Workflow,
        inputs: &'a Map<String, Value>,
        tracer: Option<&'a BoundTracer>,
    ) -> Self {
        let n = wf.steps().len();
        let mut indegree = vec![0isize; n];
        let mut or_remaining = HashSet::new();
        for id in wf.step_ids() {
            let node = wf.step(id);
            let mut group_members: HashSet<StepId> = HashSet::new();
            for (param, members) in node.or_groups() {
                indegree[id.index()] += 1;
                or_remaining.insert((id, param.to_string()));
                group_members.extend(members.iter().copied());
            }
            for pred in node.predecessors() {
                if !group_members.contains(pred) {
                    indegree[id.index()] += 1;
                }
            }
        }
        let ready: Vec<StepId> = wf
            .step_ids()
            .filter(|id| indegree[id.index()] == 0)
            .collect();
        Self {
            wf,
            inputs,
            tracer,
            states: vec![Status::Pending; n],
            shared: HashMap::new(),
            or_triggered: HashMap::new(),
            or_remaining,
            indegree,
            ready,
            last: Value::Null,
        }
    }

    fn trace(&self, event: TraceEvent) {
        if let Some(tracer) = self.tracer {
            tracer.record(event);
        }
    }

    fn begin(&mut self, id: StepId) {
        let wf = self.wf;
        self.states[id.index()] = Status::Running;
        let node = wf.step(id);
        self.trace(TraceEvent::new("step_started").with_step(node.label()));
        let ctx = StepContext {
            name: node.name(),
            label: node.label(),
            attempt: 0,
        };
        for policy in wf.workflow_policies() {
            policy.on_step_start(&ctx);
        }
    }

    fn finish(&mut self, id: StepId, result: &Result<StepOutcome, StepError>) {
        let wf = self.wf;
        let node = wf.step(id);
        let ctx = StepContext {
            name: node.name(),
            label: node.label(),
            attempt: 0,
        };
        match result {
            Ok(outcome) => {
                self.states[id.index()] = if outcome.skipped {
                    Status::Skipped
                } else {
                    Status::Succeeded
                };
                self.trace(
                    TraceEvent::new("step_finished")
                        .with_step(node.label())
                        .with_field("result", outcome.value.clone())
                        .with_field("skipped", Value::Bool(outcome.skipped)),
                );
                for policy in wf.workflow_policies() {
                    policy.on_step_success(&ctx, &outcome.value);
                }
                self.shared.insert(id, outcome.value.clone());
            }
            Err(error) => {
                self.states[id.index()] = Status::Failed;
                self.trace(
                    TraceEvent::new("step_failed")
                        .with_step(node.label())
                        .with_field("error", json!(error.to_string())),
                );
                for policy in wf.workflow_policies() {
                    policy.on_step_failure(&ctx, error);
                }
            }
        }
    }

    fn propagate(&mut self, id: StepId, outcome: &StepOutcome) {
        let wf = self.wf;
        let node = wf.step(id);
        let action = outcome.value.as_str().map(str::to_string);
        let key = action.as_deref().unwrap_or("default");
        let successors = match node.successors().get(key) {
            Some(list) => list.clone(),
            None => {
                if !node.successors().is_empty() {
                    tracing::warn!(
                        step = node.label(),
                        action = key,
                        "workflow branch ends: no successors for action"
                    );
                }
                Vec::new()
            }
        };
        for succ in successors {
            let succ_node = wf.step(succ);
            let mut decreased = false;
            for (param, members) in succ_node.or_groups() {
                let group_key = (succ, param.to_string());
                if members.contains(&id) && self.or_remaining.contains(&group_key) {
                    self.or_remaining.remove(&group_key);
                    self.or_triggered.insert(group_key, id);
                    self.indegree[succ.index()] -= 1;
                    decreased = true;
                    break;
                }
            }
            if !decreased {
                self.indegree[succ.index()] -= 1;
            }
            if self.indegree[succ.index()] == 0 {
                self.trace(TraceEvent::new("step_enqueued").with_step(succ_node.label()));
                self.ready.push(succ);
            }
        }
    }

    async fn run(mut self, workers: usize) -> DriveOutcome {
        for &id in &self.ready {
            self.trace(TraceEvent::new("step_enqueued").with_step(self.wf.step(id).label()));
        }

        while !self.ready.is_empty() {
            let wf = self.wf;
            let current_group = self
                .ready
                .iter()
                .map(|id| wf.step(*id).execution_group())
                .min()
                .unwrap_or(0);
            let batch: Vec<StepId> = self
                .ready
                .iter()
                .copied()
                .filter(|id| wf.step(*id).execution_group() == current_group)
                .collect();
            self.ready
                .retain(|id| wf.step(*id).execution_group() != current_group);

            if workers > 1 && batch.len() > workers {
                tracing::warn!(
                    batch = batch.len(),
                    workers,
                    "ready batch exceeds worker pool; running sequentially"
                );
            }
            let concurrent = workers > 1 && batch.len() > 1 && batch.len() <= workers;

            let mut results: Vec<(StepId, Result<StepOutcome, StepError>)> =
                Vec::with_capacity(batch.len());
            if concurrent {
                for &id in &batch {
                    self.begin(id);
                }
                let wf = self.wf;
                let inputs = self.inputs;
                let tracer = self.tracer.map(|t| t as &dyn Tracer);
                let shared = &self.shared;
                let or_triggered = &self.or_triggered;
                let futures: Vec<_> = batch
                    .iter()
                    .map(|&id| wf.execute_step(id, shared, or_triggered, inputs, tracer))
                    .collect();
                let outputs = futures::future::join_all(futures).await;
                results.extend(batch.iter().copied().zip(outputs));
            } else {
                for &id in &batch {
                    self.begin(id);
                    let wf = self.wf;
                    let result = wf
                        .execute_step(
                            id,
                            &self.shared,
                            &self.or_triggered,
                            self.inputs,
                            self.tracer.map(|t| t as &dyn Tracer),
                        )
                        .await;
                    results.push((id, result));
                }
            }

            let mut first_error = None;
            for (id, result) in &results {
                self.finish(*id, result);
                if first_error.is_none() {
                    if let Err(error) = result {
                        first_error = Some(error.clone());
                    }
                }
            }
            if first_error.is_some() {
                return DriveOutcome {
                    states: self.states,
                    shared: self.shared,
                    last: self.last,
                    error: first_error,
                };
            }

            for (id, result) in results {
                if let Ok(outcome) = result {
                    self.last = outcome.value.clone();
                    self.propagate(id, &outcome);
                }
            }
        }

        DriveOutcome {
            states: self.states,
            shared: self.shared,
            last: self.last,
            error: None,
        }
    }
}

//! Graph model
//!
//! Workflows are arenas of step nodes addressed by [`StepId`]; edges
//! (predecessors, per-action successors, OR-groups) are index lists. The
//! wire form and all external state keys use the stable step *name*, a
//! dense ordinal assigned at construction.
//!
//! Typed dependencies are declared explicitly through [`ParamSpec`]s: a
//! parameter either comes from the workflow inputs (`plain`), from a single
//! producer step (`dep`), or from any one of several producers
//! (`or_dep`). Declaring a dependency also inserts the predecessor edge.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::error::GraphError;
use crate::policy::{StepPolicy, WorkflowPolicy};
use crate::status::Status;
use crate::step::StepHandler;
use crate::trace::Tracer;

/// Index of a step within its workflow's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub(crate) usize);

impl StepId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Predicate consulted on a dependency's produced value before the step
/// runs. The second argument is the name of the source step (for OR-groups,
/// the member that triggered the group).
pub type ConditionFn = dyn Fn(&Value, &str) -> bool + Send + Sync;

/// Producer side of a typed dependency.
#[derive(Clone)]
pub enum DepSource {
    Single(StepId),
    /// Any one member satisfies the dependency; the first to finish wins.
    Group(Vec<StepId>),
}

/// A parameter bound to one or more producer steps.
#[derive(Clone)]
pub struct DepBinding {
    pub(crate) param: String,
    pub(crate) source: DepSource,
    pub(crate) condition: Option<Arc<ConditionFn>>,
}

enum ParamKind {
    Plain,
    Dep(StepId),
    OrDep(Vec<StepId>),
}

/// Declares how one parameter of a step handler is filled.
pub struct ParamSpec {
    name: String,
    kind: ParamKind,
    condition: Option<Arc<ConditionFn>>,
}

impl ParamSpec {
    /// A parameter consumed from the workflow inputs map.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Plain,
            condition: None,
        }
    }

    /// A parameter produced by a single predecessor step.
    pub fn dep(name: impl Into<String>, producer: StepId) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Dep(producer),
            condition: None,
        }
    }

    /// A parameter produced by any one of several predecessor steps.
    pub fn or_dep(name: impl Into<String>, producers: impl IntoIterator<Item = StepId>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::OrDep(producers.into_iter().collect()),
            condition: None,
        }
    }

    /// Attach a condition predicate; a `false` result skips the step.
    pub fn with_condition<F>(self, condition: F) -> Self
    where
        F: Fn(&Value, &str) -> bool + Send + Sync + 'static,
    {
        self.condition_arc(Arc::new(condition))
    }

    pub(crate) fn condition_arc(mut self, condition: Arc<ConditionFn>) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Everything needed to register one step with a builder.
pub struct StepSpec {
    handler: Arc<dyn StepHandler>,
    params: Vec<ParamSpec>,
    policies: Vec<Arc<dyn StepPolicy>>,
}

impl StepSpec {
    pub fn new(handler: Arc<dyn StepHandler>) -> Self {
        Self {
            handler,
            params: Vec::new(),
            policies: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn StepPolicy>) -> Self {
        self.policies.push(policy);
        self
    }
}

/// One node of a built workflow graph.
#[derive(Clone)]
pub struct StepNode {
    name: String,
    handler: Arc<dyn StepHandler>,
    predecessors: Vec<StepId>,
    successors: BTreeMap<String, Vec<StepId>>,
    deps: Vec<DepBinding>,
    plain_params: Vec<String>,
    policies: Vec<Arc<dyn StepPolicy>>,
    execution_group: usize,
}

impl StepNode {
    /// Stable name used for external state keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler label, as written to trace events.
    pub fn label(&self) -> &str {
        self.handler.label()
    }

    pub fn predecessors(&self) -> &[StepId] {
        &self.predecessors
    }

    /// Successor lists keyed by action label.
    pub fn successors(&self) -> &BTreeMap<String, Vec<StepId>> {
        &self.successors
    }

    /// OR-groups as `(param, members)` pairs.
    pub fn or_groups(&self) -> impl Iterator<Item = (&str, &[StepId])> {
        self.deps.iter().filter_map(|dep| match &dep.source {
            DepSource::Group(members) => Some((dep.param.as_str(), members.as_slice())),
            DepSource::Single(_) => None,
        })
    }

    /// Longest predecessor-edge distance from a root; orders local batches.
    pub fn execution_group(&self) -> usize {
        self.execution_group
    }

    pub(crate) fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }

    pub(crate) fn deps(&self) -> &[DepBinding] {
        &self.deps
    }

    pub(crate) fn plain_params(&self) -> &[String] {
        &self.plain_params
    }

    pub(crate) fn policies(&self) -> &[Arc<dyn StepPolicy>] {
        &self.policies
    }
}

struct BuildNode {
    name: Option<String>,
    handler: Arc<dyn StepHandler>,
    predecessors: Vec<StepId>,
    successors: BTreeMap<String, Vec<StepId>>,
    deps: Vec<DepBinding>,
    plain_params: Vec<String>,
    policies: Vec<Arc<dyn StepPolicy>>,
}

/// Incrementally assembles a workflow graph, then validates it as a whole.
pub struct WorkflowBuilder {
    workflow_id: String,
    version: String,
    steps: Vec<BuildNode>,
    outputs: Vec<StepId>,
    step_policies: Vec<Arc<dyn StepPolicy>>,
    workflow_policies: Vec<Arc<dyn WorkflowPolicy>>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl WorkflowBuilder {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version: "1".to_string(),
            steps: Vec::new(),
            outputs: Vec::new(),
            step_policies: Vec::new(),
            workflow_policies: Vec::new(),
            tracer: None,
        }
    }

    /// Set the opaque workflow version; identity is `(id, version)`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Attach a tracer consulted by the local executor.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Register a step; dependency params insert their predecessor edges.
    pub fn add_step(&mut self, spec: StepSpec) -> StepId {
        self.insert_step(None, spec)
    }

    pub(crate) fn insert_step(&mut self, name: Option<String>, spec: StepSpec) -> StepId {
        let StepSpec {
            handler,
            params,
            policies,
        } = spec;
        let id = StepId(self.steps.len());
        self.steps.push(BuildNode {
            name,
            handler,
            predecessors: Vec::new(),
            successors: BTreeMap::new(),
            deps: Vec::new(),
            plain_params: Vec::new(),
            policies,
        });
        for param in params {
            self.bind_param(id, param);
        }
        id
    }

    pub(crate) fn bind_param(&mut self, id: StepId, param: ParamSpec) {
        let ParamSpec {
            name,
            kind,
            condition,
        } = param;
        match kind {
            ParamKind::Plain => self.steps[id.0].plain_params.push(name),
            ParamKind::Dep(producer) => {
                self.link(producer, id);
                self.steps[id.0].deps.push(DepBinding {
                    param: name,
                    source: DepSource::Single(producer),
                    condition,
                });
            }
            ParamKind::OrDep(producers) => {
                for &producer in &producers {
                    self.link(producer, id);
                }
                self.steps[id.0].deps.push(DepBinding {
                    param: name,
                    source: DepSource::Group(producers),
                    condition,
                });
            }
        }
    }

    pub(crate) fn add_step_policy(&mut self, id: StepId, policy: Arc<dyn StepPolicy>) {
        self.steps[id.0].policies.push(policy);
    }

    /// Add a `default`-action edge.
    pub fn link(&mut self, from: StepId, to: StepId) {
        self.link_action(from, "default", to);
    }

    /// Add an action-labeled edge; the edge is deduplicated.
    pub fn link_action(&mut self, from: StepId, action: impl Into<String>, to: StepId) {
        let successors = self.steps[from.0].successors.entry(action.into()).or_default();
        if !successors.contains(&to) {
            successors.push(to);
        }
        let predecessors = &mut self.steps[to.0].predecessors;
        if !predecessors.contains(&from) {
            predecessors.push(from);
        }
    }

    /// Attach a step policy applied to every step of the workflow.
    pub fn step_policy(&mut self, policy: Arc<dyn StepPolicy>) {
        self.step_policies.push(policy);
    }

    /// Attach a workflow lifecycle observer.
    pub fn workflow_policy(&mut self, policy: Arc<dyn WorkflowPolicy>) {
        self.workflow_policies.push(policy);
    }

    /// Declare an output step; outputs anchor the reachable closure.
    pub fn output(&mut self, id: StepId) {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
    }

    /// Validate the graph and freeze it.
    pub fn build(self) -> Result<Workflow, GraphError> {
        let WorkflowBuilder {
            workflow_id,
            version,
            steps,
            outputs,
            step_policies,
            workflow_policies,
            tracer,
        } = self;

        if outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        let n = steps.len();

        // Every registered step must be in the closure of the outputs.
        let mut visited = vec![false; n];
        let mut stack: Vec<usize> = outputs.iter().map(|o| o.0).collect();
        while let Some(i) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            for pred in &steps[i].predecessors {
                if !visited[pred.0] {
                    stack.push(pred.0);
                }
            }
        }
        if let Some(i) = (0..n).find(|&i| !visited[i]) {
            return Err(GraphError::Unreachable(steps[i].handler.label().to_string()));
        }

        // Kahn pass: rejects cycles and assigns longest-path groups.
        let mut indegree: Vec<usize> = steps.iter().map(|s| s.predecessors.len()).collect();
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in steps.iter().enumerate() {
            for pred in &node.predecessors {
                downstream[pred.0].push(i);
            }
        }
        let mut group = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut processed = 0;
        while let Some(u) = queue.pop_front() {
            processed += 1;
            for &v in &downstream[u] {
                if group[u] + 1 > group[v] {
                    group[v] = group[u] + 1;
                }
                indegree[v] -= 1;
                if indegree[v] == 0 {
                    queue.push_back(v);
                }
            }
        }
        if processed < n {
            let i = (0..n).find(|&i| indegree[i] > 0).unwrap_or(0);
            return Err(GraphError::Cycle(steps[i].handler.label().to_string()));
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(n);
        let mut by_name = HashMap::with_capacity(n);
        for (i, node) in steps.into_iter().enumerate() {
            let name = node.name.unwrap_or_else(|| format!("step{i}"));
            if !seen.insert(name.clone()) {
                return Err(GraphError::DuplicateName(name));
            }
            by_name.insert(name.clone(), StepId(i));
            nodes.push(StepNode {
                name,
                handler: node.handler,
                predecessors: node.predecessors,
                successors: node.successors,
                deps: node.deps,
                plain_params: node.plain_params,
                policies: node.policies,
                execution_group: group[i],
            });
        }

        let step_states = vec![Status::Pending; nodes.len()];
        Ok(Workflow {
            workflow_id,
            version,
            steps: nodes,
            by_name,
            outputs,
            step_policies,
            workflow_policies,
            tracer,
            state: Status::Pending,
            step_states,
        })
    }
}

/// A rooted DAG of steps.
#[derive(Clone)]
pub struct Workflow {
    workflow_id: String,
    version: String,
    steps: Vec<StepNode>,
    by_name: HashMap<String, StepId>,
    outputs: Vec<StepId>,
    step_policies: Vec<Arc<dyn StepPolicy>>,
    workflow_policies: Vec<Arc<dyn WorkflowPolicy>>,
    tracer: Option<Arc<dyn Tracer>>,
    pub(crate) state: Status,
    pub(crate) step_states: Vec<Status>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("workflow_id", &self.workflow_id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("step_states", &self.step_states)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// State of the most recent local run.
    pub fn state(&self) -> Status {
        self.state
    }

    /// Per-step state of the most recent local run.
    pub fn step_state(&self, id: StepId) -> Status {
        self.step_states[id.0]
    }

    /// Attach a tracer after construction, e.g. on a reconstructed graph.
    pub fn set_tracer(&mut self, tracer: Arc<dyn Tracer>) {
        self.tracer = Some(tracer);
    }

    pub fn steps(&self) -> &[StepNode] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> &StepNode {
        &self.steps[id.0]
    }

    pub fn step_by_name(&self, name: &str) -> Option<StepId> {
        self.by_name.get(name).copied()
    }

    pub fn step_ids(&self) -> impl Iterator<Item = StepId> {
        (0..self.steps.len()).map(StepId)
    }

    pub fn outputs(&self) -> &[StepId] {
        &self.outputs
    }

    /// Steps without predecessors.
    pub fn roots(&self) -> Vec<StepId> {
        self.step_ids()
            .filter(|id| self.steps[id.0].predecessors.is_empty())
            .collect()
    }

    pub(crate) fn step_policies(&self) -> &[Arc<dyn StepPolicy>] {
        &self.step_policies
    }

    pub(crate) fn workflow_policies(&self) -> &[Arc<dyn WorkflowPolicy>] {
        &self.workflow_policies
    }

    pub(crate) fn tracer(&self) -> Option<&Arc<dyn Tracer>> {
        self.tracer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::FnStep;
    use serde_json::json;

    fn noop(label: &str) -> Arc<FnStep> {
        FnStep::new(label, |_| async { Ok(json!(null)) })
    }

    #[test]
    fn linear_chain_groups_and_names() {
        let mut builder = WorkflowBuilder::new("wf");
        let a = builder.add_step(StepSpec::new(noop("A")));
        let b = builder.add_step(StepSpec::new(noop("B")));
        let c = builder.add_step(StepSpec::new(noop("C")));
        builder.link(a, b);
        builder.link(b, c);
        builder.output(c);
        let wf = builder.build().unwrap();

        assert_eq!(wf.step(a).name(), "step0");
        assert_eq!(wf.step(c).name(), "step2");
        assert_eq!(wf.step(a).execution_group(), 0);
        assert_eq!(wf.step(b).execution_group(), 1);
        assert_eq!(wf.step(c).execution_group(), 2);
        assert_eq!(wf.roots(), vec![a]);
        assert_eq!(wf.step_by_name("step1"), Some(b));
    }

    #[test]
    fn dep_param_inserts_predecessor_edge() {
        let mut builder = WorkflowBuilder::new("wf");
        let producer = builder.add_step(StepSpec::new(noop("Producer")));
        let consumer = builder.add_step(
            StepSpec::new(noop("Consumer")).param(ParamSpec::dep("value", producer)),
        );
        builder.output(consumer);
        let wf = builder.build().unwrap();

        assert_eq!(wf.step(consumer).predecessors(), &[producer]);
        assert_eq!(
            wf.step(producer).successors().get("default"),
            Some(&vec![consumer])
        );
        assert_eq!(wf.step(consumer).execution_group(), 1);
    }

    #[test]
    fn or_group_membership() {
        let mut builder = WorkflowBuilder::new("wf");
        let p1 = builder.add_step(StepSpec::new(noop("P1")));
        let p2 = builder.add_step(StepSpec::new(noop("P2")));
        let join = builder.add_step(
            StepSpec::new(noop("Join")).param(ParamSpec::or_dep("value", [p1, p2])),
        );
        builder.output(join);
        let wf = builder.build().unwrap();

        let groups: Vec<_> = wf.step(join).or_groups().collect();
        assert_eq!(groups, vec![("value", &[p1, p2][..])]);
        assert_eq!(wf.step(join).predecessors(), &[p1, p2]);
    }

    #[test]
    fn duplicate_edges_are_deduplicated() {
        let mut builder = WorkflowBuilder::new("wf");
        let a = builder.add_step(StepSpec::new(noop("A")));
        let b = builder.add_step(StepSpec::new(noop("B")));
        builder.link(a, b);
        builder.link(a, b);
        builder.output(b);
        let wf = builder.build().unwrap();

        assert_eq!(wf.step(a).successors().get("default"), Some(&vec![b]));
        assert_eq!(wf.step(b).predecessors(), &[a]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut builder = WorkflowBuilder::new("wf");
        let a = builder.add_step(StepSpec::new(noop("A")));
        let b = builder.add_step(StepSpec::new(noop("B")));
        builder.link(a, b);
        builder.link(b, a);
        builder.output(b);
        assert!(matches!(builder.build(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn unreachable_step_is_rejected() {
        let mut builder = WorkflowBuilder::new("wf");
        let a = builder.add_step(StepSpec::new(noop("A")));
        let _orphan = builder.add_step(StepSpec::new(noop("Orphan")));
        builder.output(a);
        assert!(matches!(builder.build(), Err(GraphError::Unreachable(_))));
    }

    #[test]
    fn outputs_are_required() {
        let mut builder = WorkflowBuilder::new("wf");
        builder.add_step(StepSpec::new(noop("A")));
        assert!(matches!(builder.build(), Err(GraphError::NoOutputs)));
    }

    #[test]
    fn action_labelled_edges() {
        let mut builder = WorkflowBuilder::new("wf");
        let decide = builder.add_step(StepSpec::new(noop("Decide")));
        let yes = builder.add_step(StepSpec::new(noop("Yes")));
        let no = builder.add_step(StepSpec::new(noop("No")));
        builder.link_action(decide, "yes", yes);
        builder.link_action(decide, "no", no);
        builder.output(yes);
        builder.output(no);
        let wf = builder.build().unwrap();

        assert_eq!(wf.step(decide).successors().get("yes"), Some(&vec![yes]));
        assert_eq!(wf.step(decide).successors().get("no"), Some(&vec![no]));
        assert_eq!(wf.step(yes).execution_group(), 1);
    }
}

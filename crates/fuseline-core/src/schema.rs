//! Workflow wire form
//!
//! Schemas carry no executable code: steps are referenced by stable name
//! only, and workers must independently possess the handlers. Reconstruction
//! therefore pairs a schema with locally supplied [`StepSeed`]s indexed by
//! step name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::graph::{ConditionFn, ParamSpec, StepId, StepSpec, Workflow, WorkflowBuilder};
use crate::policy::{PolicyKind, PolicyRegistry, PolicySpec};
use crate::step::StepHandler;

/// Wire form of one step: structure only, no code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StepSchema {
    pub name: String,
    #[serde(default)]
    pub successors: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub predecessors: Vec<String>,
    #[serde(default)]
    pub or_groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

/// Serializable workflow structure exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkflowSchema {
    pub workflow_id: String,
    pub version: String,
    pub steps: BTreeMap<String, StepSchema>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

enum SeedKind {
    Plain,
    Dep(String),
    OrDep(Vec<String>),
}

/// Parameter binding of a seed, with producers referenced by step name.
pub struct SeedParam {
    name: String,
    kind: SeedKind,
    condition: Option<Arc<ConditionFn>>,
}

impl SeedParam {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SeedKind::Plain,
            condition: None,
        }
    }

    pub fn dep(name: impl Into<String>, producer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SeedKind::Dep(producer.into()),
            condition: None,
        }
    }

    pub fn or_dep<I, S>(name: impl Into<String>, producers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: SeedKind::OrDep(producers.into_iter().map(Into::into).collect()),
            condition: None,
        }
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value, &str) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }
}

/// Locally supplied executable side of one schema step.
pub struct StepSeed {
    handler: Arc<dyn StepHandler>,
    params: Vec<SeedParam>,
}

impl StepSeed {
    pub fn new(handler: Arc<dyn StepHandler>) -> Self {
        Self {
            handler,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: SeedParam) -> Self {
        self.params.push(param);
        self
    }
}

fn ordinal_key(name: &str) -> (u64, &str) {
    match name.strip_prefix("step").and_then(|s| s.parse::<u64>().ok()) {
        Some(i) => (i, ""),
        None => (u64::MAX, name),
    }
}

fn lookup(ids: &HashMap<String, StepId>, name: &str) -> Result<StepId, GraphError> {
    ids.get(name)
        .copied()
        .ok_or_else(|| GraphError::UnknownName(name.to_string()))
}

impl WorkflowSchema {
    /// Reconstruct a workflow graph from this schema plus the local step
    /// registry. Policies are instantiated through `registry`.
    pub fn into_workflow(
        &self,
        mut seeds: HashMap<String, StepSeed>,
        registry: &PolicyRegistry,
    ) -> Result<Workflow, GraphError> {
        let mut order: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        order.sort_by(|a, b| ordinal_key(a).cmp(&ordinal_key(b)));

        let mut builder =
            WorkflowBuilder::new(self.workflow_id.clone()).version(self.version.clone());
        let mut ids = HashMap::new();
        let mut deferred = Vec::new();

        for name in &order {
            let seed = seeds
                .remove(*name)
                .ok_or_else(|| GraphError::UnknownName(name.to_string()))?;
            let mut spec = StepSpec::new(seed.handler);
            for param in seed.params {
                match &param.kind {
                    SeedKind::Plain => spec = spec.param(ParamSpec::plain(param.name.clone())),
                    _ => deferred.push((name.to_string(), param)),
                }
            }
            let id = builder.insert_step(Some(name.to_string()), spec);
            ids.insert(name.to_string(), id);
        }

        for (step_name, param) in deferred {
            let id = lookup(&ids, &step_name)?;
            let SeedParam {
                name,
                kind,
                condition,
            } = param;
            let mut spec = match kind {
                SeedKind::Dep(producer) => ParamSpec::dep(name, lookup(&ids, &producer)?),
                SeedKind::OrDep(producers) => {
                    let members = producers
                        .iter()
                        .map(|p| lookup(&ids, p))
                        .collect::<Result<Vec<_>, _>>()?;
                    ParamSpec::or_dep(name, members)
                }
                SeedKind::Plain => unreachable!("plain params are bound eagerly"),
            };
            if let Some(condition) = condition {
                spec = spec.condition_arc(condition);
            }
            builder.bind_param(id, spec);
        }

        for (name, step) in &self.steps {
            let from = lookup(&ids, name)?;
            for (action, successors) in &step.successors {
                for successor in successors {
                    builder.link_action(from, action.clone(), lookup(&ids, successor)?);
                }
            }
            for policy in &step.policies {
                match registry.build(policy)? {
                    PolicyKind::Step(p) => builder.add_step_policy(from, p),
                    PolicyKind::Workflow(_) => {
                        return Err(GraphError::PolicyConfig {
                            name: policy.name.clone(),
                            message: "workflow policy attached to a step".to_string(),
                        })
                    }
                }
            }
        }

        for policy in &self.policies {
            match registry.build(policy)? {
                PolicyKind::Step(p) => builder.step_policy(p),
                PolicyKind::Workflow(p) => builder.workflow_policy(p),
            }
        }

        for output in &self.outputs {
            builder.output(lookup(&ids, output)?);
        }

        builder.build()
    }
}

impl Workflow {
    /// Project this graph onto its wire form.
    pub fn to_schema(&self) -> WorkflowSchema {
        let name_of = |id: &StepId| self.step(*id).name().to_string();
        let mut steps = BTreeMap::new();
        for node in self.steps() {
            let successors = node
                .successors()
                .iter()
                .map(|(action, ids)| (action.clone(), ids.iter().map(&name_of).collect()))
                .collect();
            let predecessors = node.predecessors().iter().map(&name_of).collect();
            let or_groups = node
                .or_groups()
                .map(|(param, members)| {
                    (param.to_string(), members.iter().map(&name_of).collect())
                })
                .collect();
            let policies = node.policies().iter().map(|p| p.spec()).collect();
            steps.insert(
                node.name().to_string(),
                StepSchema {
                    name: node.name().to_string(),
                    successors,
                    predecessors,
                    or_groups,
                    policies,
                },
            );
        }
        let mut policies: Vec<PolicySpec> =
            self.step_policies().iter().map(|p| p.spec()).collect();
        policies.extend(self.workflow_policies().iter().map(|p| p.spec()));
        WorkflowSchema {
            workflow_id: self.workflow_id().to_string(),
            version: self.version().to_string(),
            steps,
            outputs: self.outputs().iter().map(&name_of).collect(),
            policies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryPolicy;
    use crate::step::FnStep;
    use serde_json::json;
    use std::time::Duration;

    fn noop(label: &str) -> Arc<FnStep> {
        FnStep::new(label, |_| async { Ok(json!(null)) })
    }

    fn sample_workflow() -> Workflow {
        let mut builder = WorkflowBuilder::new("race").version("2");
        let p1 = builder.add_step(StepSpec::new(noop("P1")));
        let p2 = builder.add_step(StepSpec::new(noop("P2")));
        let winner = builder.add_step(
            StepSpec::new(noop("Winner"))
                .param(ParamSpec::or_dep("value", [p1, p2]))
                .policy(Arc::new(RetryPolicy::new(2).with_wait(Duration::ZERO))),
        );
        builder.output(winner);
        builder.build().unwrap()
    }

    #[test]
    fn schema_projects_structure() {
        let schema = sample_workflow().to_schema();

        assert_eq!(schema.workflow_id, "race");
        assert_eq!(schema.version, "2");
        assert_eq!(schema.outputs, vec!["step2"]);

        let winner = &schema.steps["step2"];
        assert_eq!(winner.predecessors, vec!["step0", "step1"]);
        assert_eq!(winner.or_groups["value"], vec!["step0", "step1"]);
        assert_eq!(winner.policies[0].name, "retry");

        let p1 = &schema.steps["step0"];
        assert_eq!(p1.successors["default"], vec!["step2"]);
    }

    #[test]
    fn schema_serde_round_trip() {
        let schema = sample_workflow().to_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: WorkflowSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }

    #[test]
    fn reconstruction_preserves_structure() {
        let schema = sample_workflow().to_schema();

        let mut seeds = HashMap::new();
        seeds.insert("step0".to_string(), StepSeed::new(noop("P1")));
        seeds.insert("step1".to_string(), StepSeed::new(noop("P2")));
        seeds.insert(
            "step2".to_string(),
            StepSeed::new(noop("Winner")).param(SeedParam::or_dep("value", ["step0", "step1"])),
        );

        let rebuilt = schema
            .into_workflow(seeds, &PolicyRegistry::default())
            .unwrap();
        assert_eq!(rebuilt.to_schema(), schema);
    }

    #[test]
    fn reconstruction_requires_all_seeds() {
        let schema = sample_workflow().to_schema();
        let err = schema
            .into_workflow(HashMap::new(), &PolicyRegistry::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownName(_)));
    }

    #[test]
    fn ordinal_ordering_is_numeric() {
        assert!(ordinal_key("step2") < ordinal_key("step10"));
        assert!(ordinal_key("step0") < ordinal_key("step1"));
        assert!(ordinal_key("step1") < ordinal_key("custom"));
    }
}

//! Policy framework
//!
//! Policies customize execution semantics without hardcoding logic in the
//! graph or the executors. A [`StepPolicy`] wraps individual step
//! invocations; a [`WorkflowPolicy`] observes workflow lifecycle events but
//! does not wrap execution. Policies are serializable as `{name, config}`
//! pairs so workflow schemas can round-trip them; the [`PolicyRegistry`]
//! maps those pairs back to instances.

mod retry;
mod timeout;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GraphError, StepError};

pub use retry::RetryPolicy;
pub use timeout::TimeoutPolicy;

/// Boxed step invocation, wrapped by [`StepPolicy::wrap`].
pub type StepFuture<'a> = BoxFuture<'a, Result<Value, StepError>>;

/// Serializable `{name, config}` form of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: Value,
}

/// Identity of the step a policy hook is being consulted for.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Stable name within the workflow (`step0`, `step1`, ...).
    pub name: &'a str,
    /// Handler label, as written to trace events.
    pub label: &'a str,
    /// Zero-based attempt counter.
    pub attempt: u32,
}

/// Outcome of [`StepPolicy::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureDecision {
    /// Re-run the step after `delay`.
    Retry { delay: Duration },
    /// Give up; the error propagates.
    Fail,
    /// Treat the step as skipped with a nil result.
    Skip,
}

/// Policy applied to individual step invocations.
///
/// Policies compose by nesting: given `[P1, P2]`, the executed chain is
/// `P1.wrap(P2.wrap(inner))`. After a failed attempt each policy's
/// `on_failure` is consulted in order; the first decision wins.
pub trait StepPolicy: Send + Sync {
    /// Registry name used in schemas.
    fn name(&self) -> &str;

    /// Serializable configuration.
    fn config(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Wrap one invocation of the step.
    fn wrap<'a>(&self, step: &StepContext<'_>, call: StepFuture<'a>) -> StepFuture<'a> {
        let _ = step;
        call
    }

    fn on_start(&self, step: &StepContext<'_>) {
        let _ = step;
    }

    fn on_success(&self, step: &StepContext<'_>, result: &Value) {
        let _ = (step, result);
    }

    fn on_failure(
        &self,
        step: &StepContext<'_>,
        error: &StepError,
        attempt: u32,
    ) -> Option<FailureDecision> {
        let _ = (step, error, attempt);
        None
    }

    fn spec(&self) -> PolicySpec {
        PolicySpec {
            name: self.name().to_string(),
            config: self.config(),
        }
    }
}

/// Policy observing workflow lifecycle events.
pub trait WorkflowPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> Value {
        Value::Object(Map::new())
    }

    fn on_workflow_start(&self, workflow_id: &str) {
        let _ = workflow_id;
    }

    /// `result` is `None` when the workflow failed.
    fn on_workflow_finished(&self, workflow_id: &str, result: Option<&Value>) {
        let _ = (workflow_id, result);
    }

    fn on_step_start(&self, step: &StepContext<'_>) {
        let _ = step;
    }

    fn on_step_success(&self, step: &StepContext<'_>, result: &Value) {
        let _ = (step, result);
    }

    fn on_step_failure(&self, step: &StepContext<'_>, error: &StepError) {
        let _ = (step, error);
    }

    fn spec(&self) -> PolicySpec {
        PolicySpec {
            name: self.name().to_string(),
            config: self.config(),
        }
    }
}

/// A policy instance built from a [`PolicySpec`].
#[derive(Clone)]
pub enum PolicyKind {
    Step(Arc<dyn StepPolicy>),
    Workflow(Arc<dyn WorkflowPolicy>),
}

impl std::fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKind::Step(p) => f.debug_tuple("Step").field(&p.name()).finish(),
            PolicyKind::Workflow(p) => f.debug_tuple("Workflow").field(&p.name()).finish(),
        }
    }
}

type PolicyBuilder = Box<dyn Fn(&Value) -> Result<PolicyKind, GraphError> + Send + Sync>;

/// Name-indexed policy constructors, used when reconstructing a workflow
/// from its schema.
pub struct PolicyRegistry {
    builders: HashMap<String, PolicyBuilder>,
}

impl PolicyRegistry {
    /// Registry with no entries.
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register a constructor under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&Value) -> Result<PolicyKind, GraphError> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    /// Instantiate the policy described by `spec`.
    pub fn build(&self, spec: &PolicySpec) -> Result<PolicyKind, GraphError> {
        let builder = self
            .builders
            .get(&spec.name)
            .ok_or_else(|| GraphError::UnknownPolicy(spec.name.clone()))?;
        builder(&spec.config)
    }
}

impl Default for PolicyRegistry {
    /// Registry with the built-in `retry` and `timeout` policies.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("retry", |config| {
            Ok(PolicyKind::Step(Arc::new(RetryPolicy::from_config(config))))
        });
        registry.register("timeout", |config| {
            Ok(PolicyKind::Step(Arc::new(TimeoutPolicy::from_config(
                config,
            )?)))
        });
        registry
    }
}

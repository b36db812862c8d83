//! Step handlers
//!
//! A handler is the executable side of a step: the graph references it by
//! `StepId`, the wire form only by name. Workers must hold the same handlers
//! as the driver that built the workflow.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::StepError;

/// Resolved arguments for one step invocation: typed dependency values plus
/// the plain parameters drawn from the workflow inputs.
#[derive(Debug, Clone, Default)]
pub struct StepArgs {
    values: Map<String, Value>,
}

impl StepArgs {
    pub(crate) fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Look up a parameter, failing the step when it is absent.
    pub fn require(&self, name: &str) -> Result<&Value, StepError> {
        self.values
            .get(name)
            .ok_or_else(|| StepError::MissingDependency(name.to_string()))
    }

    /// All resolved parameters.
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// Executable unit of work.
///
/// The `label` identifies the step kind in trace events; it does not need to
/// be unique within a workflow.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn label(&self) -> &str;

    async fn run(&self, args: StepArgs) -> Result<Value, StepError>;
}

type HandlerFn =
    Box<dyn Fn(StepArgs) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// Step handler wrapping an async closure.
pub struct FnStep {
    label: String,
    func: HandlerFn,
}

impl FnStep {
    /// Wrap an async function as a step handler.
    pub fn new<F, Fut>(label: impl Into<String>, func: F) -> Arc<Self>
    where
        F: Fn(StepArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Arc::new(Self {
            label: label.into(),
            func: Box::new(move |args| Box::pin(func(args))),
        })
    }
}

#[async_trait]
impl StepHandler for FnStep {
    fn label(&self) -> &str {
        &self.label
    }

    async fn run(&self, args: StepArgs) -> Result<Value, StepError> {
        (self.func)(args).await
    }
}

//! Worker execution loop
//!
//! A worker owns a broker client and the locally known workflows. On
//! construction it registers their schemas; the work loop then polls for
//! leased assignments, maps payload results back onto local step ids,
//! executes the step through the policy chain and reports the outcome.
//! Execution is at-least-once: the broker discards reports from anyone but
//! the current leaseholder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fuseline_broker::{StepAssignment, StepReport};
use fuseline_core::{
    BoundTracer, Status, TraceEvent, Tracer, Workflow, WorkflowSchema,
};
use serde_json::{json, Map, Value};

use crate::client::{BrokerClient, ClientError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A locator or assignment referenced a workflow this worker does not hold.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// A repository locator was not known to the broker.
    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    /// A spawned worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Join(String),
}

/// Long-lived process that pulls assignments from the broker and reports
/// outcomes.
pub struct Worker {
    client: Arc<dyn BrokerClient>,
    worker_id: String,
    workflows: HashMap<String, Workflow>,
    poll_interval: Duration,
    tracer: Option<Arc<dyn Tracer>>,
}

impl Worker {
    /// Register `workflows` with the broker and return the connected worker.
    pub async fn connect(
        client: Arc<dyn BrokerClient>,
        workflows: Vec<Workflow>,
    ) -> Result<Self, WorkerError> {
        let schemas: Vec<WorkflowSchema> = workflows.iter().map(Workflow::to_schema).collect();
        let worker_id = client.register_worker(&schemas).await?;
        tracing::info!(worker_id = %worker_id, workflows = workflows.len(), "worker connected");
        let workflows = workflows
            .into_iter()
            .map(|wf| (wf.workflow_id().to_string(), wf))
            .collect();
        Ok(Self {
            client,
            worker_id,
            workflows,
            poll_interval: Duration::from_millis(500),
            tracer: None,
        })
    }

    /// Interval between polls when blocking on an empty broker.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Attach a tracer; events are bound to each assignment's instance.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll, execute and report until the broker runs dry. With `block` the
    /// loop sleeps and keeps polling instead of returning.
    pub async fn work(&self, block: bool) -> Result<(), WorkerError> {
        loop {
            self.client.keep_alive(&self.worker_id).await?;
            match self.client.get_step(&self.worker_id).await? {
                Some(assignment) => self.process(assignment).await?,
                None if block => tokio::time::sleep(self.poll_interval).await,
                None => return Ok(()),
            }
        }
    }

    /// Fetch and execute at most one assignment; `true` if one was processed.
    pub async fn work_once(&self) -> Result<bool, WorkerError> {
        self.client.keep_alive(&self.worker_id).await?;
        match self.client.get_step(&self.worker_id).await? {
            Some(assignment) => {
                self.process(assignment).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, assignment: StepAssignment) -> Result<(), WorkerError> {
        let workflow = self
            .workflows
            .get(&assignment.workflow_id)
            .ok_or_else(|| WorkerError::UnknownWorkflow(assignment.workflow_id.clone()))?;
        let step_id = match workflow.step_by_name(&assignment.step_name) {
            Some(id) => id,
            None => {
                tracing::warn!(
                    workflow_id = %assignment.workflow_id,
                    step = %assignment.step_name,
                    "assignment names an unknown step; leaving it to lease expiry"
                );
                return Ok(());
            }
        };
        let label = workflow.step(step_id).label().to_string();

        let mut shared = HashMap::new();
        for (name, value) in &assignment.payload.results {
            if let Some(id) = workflow.step_by_name(name) {
                shared.insert(id, value.clone());
            }
        }

        let tracer = self.tracer.as_ref().map(|t| {
            BoundTracer::new(
                t.clone(),
                assignment.workflow_id.clone(),
                assignment.instance_id.clone(),
            )
        });
        if let Some(t) = &tracer {
            t.record(TraceEvent::new("step_started").with_step(label.clone()));
        }

        let or_triggered = HashMap::new();
        let outcome = workflow
            .execute_step(
                step_id,
                &shared,
                &or_triggered,
                &assignment.payload.workflow_inputs,
                tracer.as_ref().map(|t| t as &dyn Tracer),
            )
            .await;

        let (state, result) = match outcome {
            Ok(outcome) => {
                if let Some(t) = &tracer {
                    t.record(
                        TraceEvent::new("step_finished")
                            .with_step(label)
                            .with_field("result", outcome.value.clone())
                            .with_field("skipped", Value::Bool(outcome.skipped)),
                    );
                }
                let state = if outcome.skipped {
                    Status::Skipped
                } else {
                    Status::Succeeded
                };
                (state, outcome.value)
            }
            Err(error) => {
                tracing::warn!(
                    workflow_id = %assignment.workflow_id,
                    step = %assignment.step_name,
                    error = %error,
                    "step execution failed"
                );
                if let Some(t) = &tracer {
                    t.record(
                        TraceEvent::new("step_failed")
                            .with_step(label)
                            .with_field("error", json!(error.to_string())),
                    );
                }
                (Status::Failed, Value::Null)
            }
        };

        self.client
            .report_step(
                &self.worker_id,
                StepReport {
                    workflow_id: assignment.workflow_id,
                    instance_id: assignment.instance_id,
                    step_name: assignment.step_name,
                    state,
                    result,
                },
            )
            .await?;
        Ok(())
    }
}

/// Register a run of `workflow` with the broker and enqueue its roots.
pub async fn dispatch(
    client: &dyn BrokerClient,
    workflow: &Workflow,
    inputs: Option<Map<String, Value>>,
) -> Result<String, ClientError> {
    client.dispatch_workflow(&workflow.to_schema(), inputs).await
}

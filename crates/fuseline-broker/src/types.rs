//! Broker wire types
//!
//! DTOs exchanged between broker and workers, over HTTP or in process.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fuseline_core::Status;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

/// Values shipped with an assignment: the run's inputs plus the recorded
/// results of the step's predecessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepPayload {
    #[schema(value_type = Object)]
    pub workflow_inputs: Map<String, Value>,
    #[schema(value_type = Object)]
    pub results: BTreeMap<String, Value>,
}

/// A time-bounded lease of one queued step to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepAssignment {
    pub workflow_id: String,
    pub instance_id: String,
    pub step_name: String,
    pub payload: StepPayload,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of an executed step, sent back by the leaseholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepReport {
    pub workflow_id: String,
    pub instance_id: String,
    pub step_name: String,
    pub state: Status,
    #[schema(value_type = Object)]
    pub result: Value,
}

/// The most recent step processed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LastTask {
    pub workflow_id: String,
    pub instance_id: String,
    pub step_name: String,
    pub success: bool,
}

/// Liveness metadata for a connected worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_task: Option<LastTask>,
}

/// Metadata for a workflow repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RepositoryInfo {
    pub name: String,
    pub url: String,
    pub workflows: Vec<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

/// A workflow locator paired with its repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowInfo {
    pub repository: String,
    pub workflow: String,
}

//! # Fuseline runtime storage
//!
//! The [`RuntimeStorage`] trait holds everything the broker persists about a
//! run: per-instance FIFO ready queues with idempotent membership, step
//! states and results, workflow inputs and assignment leases. All operations
//! are keyed by `(workflow_id, instance_id[, step_name])` and must be
//! individually atomic.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuseline_core::Status;
use serde_json::{Map, Value};

pub use memory::MemoryRuntimeStorage;
pub use postgres::PostgresRuntimeStorage;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Stored data could not be interpreted
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// An outstanding assignment lease.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Interface for persisting workflow runtime state.
///
/// Implementations must be thread-safe; the broker is the only writer but
/// may issue operations from concurrent request handlers.
#[async_trait]
pub trait RuntimeStorage: Send + Sync + 'static {
    /// Initialize storage for a run: every step starts `PENDING`, and any
    /// queue or assignment residue under the same key is cleared.
    async fn create_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        steps: &[String],
    ) -> Result<(), StoreError>;

    /// Mark `step_name` ready. A name already present in the per-instance
    /// queued-set is a no-op.
    async fn enqueue(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError>;

    /// Idempotent enqueue at the head of the FIFO, used when a lease expires
    /// and the step is reclaimed.
    async fn requeue_front(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError>;

    /// Remove and return the head of the FIFO.
    async fn fetch_next(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Number of queued steps.
    async fn queue_size(&self, workflow_id: &str, instance_id: &str)
        -> Result<usize, StoreError>;

    /// Record that `worker_id` holds the lease on `step_name`.
    async fn assign_step(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove the lease on `step_name`.
    async fn clear_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError>;

    /// Current lease on `step_name`, if any.
    async fn get_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Lease>, StoreError>;

    /// Steps whose lease expired before `now`.
    async fn expired_assignments(
        &self,
        workflow_id: &str,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    async fn set_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        state: Status,
    ) -> Result<(), StoreError>;

    async fn get_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Status>, StoreError>;

    /// All `(step_name, state)` pairs of the run.
    async fn list_states(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Vec<(String, Status)>, StoreError>;

    /// Persist workflow input parameters; inputs are immutable for the
    /// duration of the instance.
    async fn set_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<(), StoreError>;

    async fn get_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Map<String, Value>, StoreError>;

    /// Persist a step result for dependency lookups. A nil result is stored
    /// as JSON `null`, distinct from "no result recorded".
    async fn set_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StoreError>;

    async fn get_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Mark the run finished and clear its queue and leases.
    async fn finalize_run(&self, workflow_id: &str, instance_id: &str) -> Result<(), StoreError>;

    /// Whether the run has been finalized (or has nothing left to do).
    async fn is_finished(&self, workflow_id: &str, instance_id: &str)
        -> Result<bool, StoreError>;
}

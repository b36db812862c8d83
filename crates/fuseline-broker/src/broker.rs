//! Scheduling broker
//!
//! The broker is the single writer of instance state. Registry data
//! (schemas, workers, repositories, dispatch order) lives behind one lock
//! and is never held across storage awaits; runtime state goes through
//! [`RuntimeStorage`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fuseline_core::{Status, StepSchema, WorkflowSchema};
use fuseline_storage::{RuntimeStorage, StoreError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{
    LastTask, RepositoryInfo, StepAssignment, StepPayload, StepReport, WorkerInfo, WorkflowInfo,
};

/// Default assignment lease.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Default worker liveness TTL.
pub const DEFAULT_WORKER_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A `(workflow_id, version)` was re-registered with a different schema.
    #[error("workflow schema mismatch for {workflow_id}@{version}")]
    SchemaMismatch {
        workflow_id: String,
        version: String,
    },

    /// A report referenced an instance the broker never dispatched.
    #[error("unknown workflow instance {workflow_id}/{instance_id}")]
    UnknownInstance {
        workflow_id: String,
        instance_id: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

type SchemaKey = (String, String);

#[derive(Clone)]
struct InstanceRef {
    workflow_id: String,
    version: String,
    instance_id: String,
}

#[derive(Default)]
struct Registry {
    next_worker_id: u64,
    workers: HashMap<String, HashSet<SchemaKey>>,
    last_seen: HashMap<String, DateTime<Utc>>,
    connected_at: HashMap<String, DateTime<Utc>>,
    last_task: HashMap<String, LastTask>,
    schemas: HashMap<SchemaKey, WorkflowSchema>,
    instances: Vec<InstanceRef>,
    instance_version: HashMap<(String, String), String>,
    repositories: BTreeMap<String, RepositoryInfo>,
}

impl Registry {
    fn prune_dead(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now - **seen > ttl)
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        for worker_id in expired {
            tracing::debug!(worker_id = %worker_id, "pruning dead worker");
            self.workers.remove(&worker_id);
            self.last_seen.remove(&worker_id);
            self.connected_at.remove(&worker_id);
            self.last_task.remove(&worker_id);
        }
    }

    /// Store `schema` under its key, rejecting a structurally different
    /// duplicate.
    fn admit_schema(&mut self, schema: &WorkflowSchema) -> Result<SchemaKey, BrokerError> {
        let key = (schema.workflow_id.clone(), schema.version.clone());
        match self.schemas.get(&key) {
            Some(existing) if existing != schema => Err(BrokerError::SchemaMismatch {
                workflow_id: schema.workflow_id.clone(),
                version: schema.version.clone(),
            }),
            Some(_) => Ok(key),
            None => {
                self.schemas.insert(key.clone(), schema.clone());
                Ok(key)
            }
        }
    }
}

/// Catalogue of workflow schemas and workers, dispatcher of runs, and the
/// arbiter of assignment leases.
pub struct Broker {
    store: Arc<dyn RuntimeStorage>,
    registry: RwLock<Registry>,
    worker_ttl: chrono::Duration,
}

impl Broker {
    pub fn new(store: Arc<dyn RuntimeStorage>) -> Self {
        Self {
            store,
            registry: RwLock::new(Registry::default()),
            worker_ttl: chrono::Duration::from_std(DEFAULT_WORKER_TTL)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Override the worker liveness TTL.
    pub fn with_worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self
    }

    pub fn store(&self) -> &Arc<dyn RuntimeStorage> {
        &self.store
    }

    /// Register a worker eligible for `schemas` and return its id.
    pub fn register_worker(&self, schemas: &[WorkflowSchema]) -> Result<String, BrokerError> {
        let now = Utc::now();
        let mut registry = self.registry.write();
        registry.prune_dead(now, self.worker_ttl);

        let mut keys = HashSet::new();
        for schema in schemas {
            keys.insert(registry.admit_schema(schema)?);
        }

        registry.next_worker_id += 1;
        let worker_id = registry.next_worker_id.to_string();
        registry.workers.insert(worker_id.clone(), keys);
        registry.last_seen.insert(worker_id.clone(), now);
        registry.connected_at.insert(worker_id.clone(), now);
        registry.last_task.remove(&worker_id);
        tracing::info!(worker_id = %worker_id, workflows = schemas.len(), "worker registered");
        Ok(worker_id)
    }

    /// Create a run, persist its inputs and enqueue the root steps.
    pub async fn dispatch_workflow(
        &self,
        schema: &WorkflowSchema,
        inputs: Option<Map<String, Value>>,
    ) -> Result<String, BrokerError> {
        {
            let mut registry = self.registry.write();
            registry.prune_dead(Utc::now(), self.worker_ttl);
            registry.admit_schema(schema)?;
        }

        let instance_id = Uuid::new_v4().simple().to_string();
        let step_names: Vec<String> = schema.steps.keys().cloned().collect();
        self.store
            .create_run(&schema.workflow_id, &instance_id, &step_names)
            .await?;
        self.store
            .set_inputs(&schema.workflow_id, &instance_id, &inputs.unwrap_or_default())
            .await?;
        for (name, step) in &schema.steps {
            if step.predecessors.is_empty() {
                self.store
                    .enqueue(&schema.workflow_id, &instance_id, name)
                    .await?;
            }
        }

        {
            let mut registry = self.registry.write();
            registry.instances.push(InstanceRef {
                workflow_id: schema.workflow_id.clone(),
                version: schema.version.clone(),
                instance_id: instance_id.clone(),
            });
            registry.instance_version.insert(
                (schema.workflow_id.clone(), instance_id.clone()),
                schema.version.clone(),
            );
        }
        tracing::info!(
            workflow_id = %schema.workflow_id,
            instance_id = %instance_id,
            "workflow dispatched"
        );
        Ok(instance_id)
    }

    /// Lease length for `step`: the default, extended past any `timeout`
    /// policy's inner deadline so the lease cannot expire first.
    fn lease_for(step: &StepSchema) -> chrono::Duration {
        let default =
            chrono::Duration::from_std(DEFAULT_LEASE).unwrap_or(chrono::Duration::MAX);
        for policy in &step.policies {
            if policy.name == "timeout" {
                if let Some(seconds) = policy.config.get("seconds").and_then(Value::as_f64) {
                    return chrono::Duration::milliseconds((seconds * 1000.0) as i64) + default;
                }
            }
        }
        default
    }

    /// Lease the next ready step this worker is eligible for, walking
    /// instances in dispatch order. Expired leases encountered on the way
    /// are reclaimed: the step returns to the head of the queue.
    pub async fn get_step(&self, worker_id: &str) -> Result<Option<StepAssignment>, BrokerError> {
        let now = Utc::now();
        let eligible: Vec<InstanceRef> = {
            let mut registry = self.registry.write();
            registry.prune_dead(now, self.worker_ttl);
            let allowed = match registry.workers.get(worker_id) {
                Some(allowed) => allowed.clone(),
                None => return Ok(None),
            };
            registry.last_seen.insert(worker_id.to_string(), now);
            registry
                .instances
                .iter()
                .filter(|i| allowed.contains(&(i.workflow_id.clone(), i.version.clone())))
                .cloned()
                .collect()
        };

        for instance in eligible {
            if self
                .store
                .is_finished(&instance.workflow_id, &instance.instance_id)
                .await?
            {
                continue;
            }

            for step_name in self
                .store
                .expired_assignments(&instance.workflow_id, &instance.instance_id, now)
                .await?
            {
                tracing::warn!(
                    workflow_id = %instance.workflow_id,
                    instance_id = %instance.instance_id,
                    step = %step_name,
                    "assignment lease expired; reclaiming step"
                );
                self.store
                    .clear_assignment(&instance.workflow_id, &instance.instance_id, &step_name)
                    .await?;
                self.store
                    .set_state(
                        &instance.workflow_id,
                        &instance.instance_id,
                        &step_name,
                        Status::Pending,
                    )
                    .await?;
                self.store
                    .requeue_front(&instance.workflow_id, &instance.instance_id, &step_name)
                    .await?;
            }

            let step_name = match self
                .store
                .fetch_next(&instance.workflow_id, &instance.instance_id)
                .await?
            {
                Some(step_name) => step_name,
                None => continue,
            };

            let schema = {
                let registry = self.registry.read();
                registry
                    .schemas
                    .get(&(instance.workflow_id.clone(), instance.version.clone()))
                    .cloned()
            };
            let schema = match schema {
                Some(schema) => schema,
                None => continue,
            };
            let step = match schema.steps.get(&step_name) {
                Some(step) => step,
                None => {
                    tracing::warn!(step = %step_name, "ignoring unknown queue entry");
                    continue;
                }
            };

            let workflow_inputs = self
                .store
                .get_inputs(&instance.workflow_id, &instance.instance_id)
                .await?;
            let mut results = BTreeMap::new();
            for pred in &step.predecessors {
                if let Some(value) = self
                    .store
                    .get_result(&instance.workflow_id, &instance.instance_id, pred)
                    .await?
                {
                    results.insert(pred.clone(), value);
                }
            }

            let assigned_at = now;
            let expires_at = assigned_at + Self::lease_for(step);
            self.store
                .assign_step(
                    &instance.workflow_id,
                    &instance.instance_id,
                    &step_name,
                    worker_id,
                    expires_at,
                )
                .await?;
            self.store
                .set_state(
                    &instance.workflow_id,
                    &instance.instance_id,
                    &step_name,
                    Status::Running,
                )
                .await?;

            return Ok(Some(StepAssignment {
                workflow_id: instance.workflow_id,
                instance_id: instance.instance_id,
                step_name,
                payload: StepPayload {
                    workflow_inputs,
                    results,
                },
                assigned_at,
                expires_at,
            }));
        }
        Ok(None)
    }

    /// Readiness: every OR-group has a finished member, every other
    /// predecessor is finished, and the step itself is still pending.
    async fn ready(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step: &StepSchema,
    ) -> Result<bool, BrokerError> {
        let or_members: HashSet<&String> = step.or_groups.values().flatten().collect();
        for group in step.or_groups.values() {
            let mut satisfied = false;
            for member in group {
                if let Some(state) = self.store.get_state(workflow_id, instance_id, member).await?
                {
                    if state.is_finished() {
                        satisfied = true;
                        break;
                    }
                }
            }
            if !satisfied {
                return Ok(false);
            }
        }
        for pred in &step.predecessors {
            if or_members.contains(pred) {
                continue;
            }
            match self.store.get_state(workflow_id, instance_id, pred).await? {
                Some(state) if state.is_finished() => {}
                _ => return Ok(false),
            }
        }
        Ok(self.store.get_state(workflow_id, instance_id, &step.name).await?
            == Some(Status::Pending))
    }

    /// Store a step outcome; on success fan out to newly-ready successors,
    /// on failure cancel the instance's remaining pending steps.
    ///
    /// Reports from anyone but the current leaseholder are silently ignored,
    /// as are reports for steps with no outstanding lease (a reclaimed
    /// assignment).
    pub async fn report_step(
        &self,
        worker_id: &str,
        report: StepReport,
    ) -> Result<(), BrokerError> {
        let now = Utc::now();
        let schema = {
            let mut registry = self.registry.write();
            registry.prune_dead(now, self.worker_ttl);
            let version = registry
                .instance_version
                .get(&(report.workflow_id.clone(), report.instance_id.clone()))
                .cloned()
                .ok_or_else(|| BrokerError::UnknownInstance {
                    workflow_id: report.workflow_id.clone(),
                    instance_id: report.instance_id.clone(),
                })?;
            registry
                .schemas
                .get(&(report.workflow_id.clone(), version))
                .cloned()
                .ok_or_else(|| BrokerError::UnknownInstance {
                    workflow_id: report.workflow_id.clone(),
                    instance_id: report.instance_id.clone(),
                })?
        };

        let lease = self
            .store
            .get_assignment(&report.workflow_id, &report.instance_id, &report.step_name)
            .await?;
        match lease {
            Some(lease) if lease.worker_id == worker_id => {}
            _ => {
                tracing::debug!(
                    worker_id = %worker_id,
                    step = %report.step_name,
                    "ignoring report from non-leaseholder"
                );
                return Ok(());
            }
        }

        // State and result are durable before any successor is enqueued.
        self.store
            .clear_assignment(&report.workflow_id, &report.instance_id, &report.step_name)
            .await?;
        self.store
            .set_state(
                &report.workflow_id,
                &report.instance_id,
                &report.step_name,
                report.state,
            )
            .await?;
        self.store
            .set_result(
                &report.workflow_id,
                &report.instance_id,
                &report.step_name,
                &report.result,
            )
            .await?;

        if report.state.is_finished() {
            if let Some(step) = schema.steps.get(&report.step_name) {
                let action = report.result.as_str();
                let successors: Vec<String> = match action.and_then(|a| step.successors.get(a)) {
                    Some(list) => list.clone(),
                    None => step.successors.get("default").cloned().unwrap_or_default(),
                };
                for successor in successors {
                    if let Some(succ) = schema.steps.get(&successor) {
                        if self
                            .ready(&report.workflow_id, &report.instance_id, succ)
                            .await?
                        {
                            self.store
                                .enqueue(&report.workflow_id, &report.instance_id, &successor)
                                .await?;
                        }
                    }
                }
            }
        } else if report.state == Status::Failed {
            for (name, state) in self
                .store
                .list_states(&report.workflow_id, &report.instance_id)
                .await?
            {
                if state == Status::Pending {
                    self.store
                        .set_state(
                            &report.workflow_id,
                            &report.instance_id,
                            &name,
                            Status::Cancelled,
                        )
                        .await?;
                }
            }
            self.store
                .finalize_run(&report.workflow_id, &report.instance_id)
                .await?;
            tracing::info!(
                workflow_id = %report.workflow_id,
                instance_id = %report.instance_id,
                step = %report.step_name,
                "step failed; instance cancelled"
            );
        }

        if report.state != Status::Failed
            && self
                .store
                .queue_size(&report.workflow_id, &report.instance_id)
                .await?
                == 0
        {
            let states = self
                .store
                .list_states(&report.workflow_id, &report.instance_id)
                .await?;
            let active = states
                .iter()
                .any(|(_, s)| matches!(s, Status::Pending | Status::Running));
            if !active
                && !self
                    .store
                    .is_finished(&report.workflow_id, &report.instance_id)
                    .await?
            {
                self.store
                    .finalize_run(&report.workflow_id, &report.instance_id)
                    .await?;
                tracing::info!(
                    workflow_id = %report.workflow_id,
                    instance_id = %report.instance_id,
                    "workflow instance finalized"
                );
            }
        }

        let mut registry = self.registry.write();
        if registry.workers.contains_key(worker_id) {
            registry.last_seen.insert(worker_id.to_string(), now);
            registry.last_task.insert(
                worker_id.to_string(),
                LastTask {
                    workflow_id: report.workflow_id,
                    instance_id: report.instance_id,
                    step_name: report.step_name,
                    success: report.state == Status::Succeeded,
                },
            );
        }
        Ok(())
    }

    /// Refresh a worker's liveness timestamp.
    pub fn keep_alive(&self, worker_id: &str) {
        let now = Utc::now();
        let mut registry = self.registry.write();
        if registry.workers.contains_key(worker_id) {
            registry.last_seen.insert(worker_id.to_string(), now);
        }
        registry.prune_dead(now, self.worker_ttl);
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let now = Utc::now();
        let mut registry = self.registry.write();
        registry.prune_dead(now, self.worker_ttl);
        let mut workers: Vec<WorkerInfo> = registry
            .workers
            .keys()
            .map(|worker_id| WorkerInfo {
                worker_id: worker_id.clone(),
                connected_at: registry
                    .connected_at
                    .get(worker_id)
                    .copied()
                    .unwrap_or(now),
                last_seen: registry.last_seen.get(worker_id).copied().unwrap_or(now),
                last_task: registry.last_task.get(worker_id).cloned(),
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    /// Per-step states of a dispatched instance, for run observation.
    pub async fn instance_states(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Vec<(String, Status)>, BrokerError> {
        Ok(self.store.list_states(workflow_id, instance_id).await?)
    }

    // Repository management --------------------------------------------------

    pub fn register_repository(&self, repo: RepositoryInfo) {
        let mut registry = self.registry.write();
        registry.repositories.insert(repo.name.clone(), repo);
    }

    pub fn get_repository(&self, name: &str) -> Option<RepositoryInfo> {
        self.registry.read().repositories.get(name).cloned()
    }

    pub fn list_repositories(&self, page: usize, page_size: usize) -> Vec<RepositoryInfo> {
        let registry = self.registry.read();
        let start = page.saturating_sub(1) * page_size;
        registry
            .repositories
            .values()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect()
    }

    pub fn list_workflows(&self) -> Vec<WorkflowInfo> {
        let registry = self.registry.read();
        registry
            .repositories
            .values()
            .flat_map(|repo| {
                repo.workflows.iter().map(|workflow| WorkflowInfo {
                    repository: repo.name.clone(),
                    workflow: workflow.clone(),
                })
            })
            .collect()
    }
}

//! In-memory implementation of RuntimeStorage

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuseline_core::Status;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::{Lease, RuntimeStorage, StoreError};

type RunKey = (String, String);

#[derive(Default)]
struct Inner {
    queues: HashMap<RunKey, VecDeque<String>>,
    queued: HashMap<RunKey, HashSet<String>>,
    states: HashMap<RunKey, HashMap<String, Status>>,
    results: HashMap<RunKey, HashMap<String, Value>>,
    inputs: HashMap<RunKey, Map<String, Value>>,
    assignments: HashMap<RunKey, HashMap<String, Lease>>,
    finished: HashSet<RunKey>,
}

fn key(workflow_id: &str, instance_id: &str) -> RunKey {
    (workflow_id.to_string(), instance_id.to_string())
}

/// In-memory storage used for tests, examples and single-process brokers.
///
/// Provides the same semantics as the PostgreSQL adapter.
#[derive(Default)]
pub struct MemoryRuntimeStorage {
    inner: RwLock<Inner>,
}

impl MemoryRuntimeStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStorage for MemoryRuntimeStorage {
    async fn create_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        steps: &[String],
    ) -> Result<(), StoreError> {
        let key = key(workflow_id, instance_id);
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let states = inner.states.entry(key.clone()).or_default();
        states.clear();
        for step in steps {
            states.insert(step.clone(), Status::Pending);
        }
        inner.queues.remove(&key);
        inner.queued.remove(&key);
        inner.results.remove(&key);
        inner.inputs.remove(&key);
        inner.assignments.remove(&key);
        inner.finished.remove(&key);
        Ok(())
    }

    async fn enqueue(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        let key = key(workflow_id, instance_id);
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let queued = inner.queued.entry(key.clone()).or_default();
        if !queued.insert(step_name.to_string()) {
            return Ok(());
        }
        inner
            .queues
            .entry(key)
            .or_default()
            .push_back(step_name.to_string());
        Ok(())
    }

    async fn requeue_front(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        let key = key(workflow_id, instance_id);
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let queued = inner.queued.entry(key.clone()).or_default();
        if !queued.insert(step_name.to_string()) {
            return Ok(());
        }
        inner
            .queues
            .entry(key)
            .or_default()
            .push_front(step_name.to_string());
        Ok(())
    }

    async fn fetch_next(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = key(workflow_id, instance_id);
        let mut inner = self.inner.write();
        let step = match inner.queues.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(step) => step,
            None => return Ok(None),
        };
        if let Some(queued) = inner.queued.get_mut(&key) {
            queued.remove(&step);
        }
        Ok(Some(step))
    }

    async fn queue_size(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<usize, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .queues
            .get(&key(workflow_id, instance_id))
            .map_or(0, VecDeque::len))
    }

    async fn assign_step(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .assignments
            .entry(key(workflow_id, instance_id))
            .or_default()
            .insert(
                step_name.to_string(),
                Lease {
                    worker_id: worker_id.to_string(),
                    expires_at,
                },
            );
        Ok(())
    }

    async fn clear_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(assignments) = inner.assignments.get_mut(&key(workflow_id, instance_id)) {
            assignments.remove(step_name);
        }
        Ok(())
    }

    async fn get_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Lease>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .assignments
            .get(&key(workflow_id, instance_id))
            .and_then(|assignments| assignments.get(step_name))
            .cloned())
    }

    async fn expired_assignments(
        &self,
        workflow_id: &str,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        let mut expired: Vec<String> = inner
            .assignments
            .get(&key(workflow_id, instance_id))
            .map(|assignments| {
                assignments
                    .iter()
                    .filter(|(_, lease)| lease.expires_at < now)
                    .map(|(step, _)| step.clone())
                    .collect()
            })
            .unwrap_or_default();
        expired.sort();
        Ok(expired)
    }

    async fn set_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        state: Status,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .states
            .entry(key(workflow_id, instance_id))
            .or_default()
            .insert(step_name.to_string(), state);
        Ok(())
    }

    async fn get_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Status>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .states
            .get(&key(workflow_id, instance_id))
            .and_then(|states| states.get(step_name))
            .copied())
    }

    async fn list_states(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Vec<(String, Status)>, StoreError> {
        let inner = self.inner.read();
        let mut states: Vec<(String, Status)> = inner
            .states
            .get(&key(workflow_id, instance_id))
            .map(|states| states.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(states)
    }

    async fn set_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .inputs
            .insert(key(workflow_id, instance_id), inputs.clone());
        Ok(())
    }

    async fn get_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Map<String, Value>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .inputs
            .get(&key(workflow_id, instance_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .results
            .entry(key(workflow_id, instance_id))
            .or_default()
            .insert(step_name.to_string(), result.clone());
        Ok(())
    }

    async fn get_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .results
            .get(&key(workflow_id, instance_id))
            .and_then(|results| results.get(step_name))
            .cloned())
    }

    async fn finalize_run(&self, workflow_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let key = key(workflow_id, instance_id);
        let mut inner = self.inner.write();
        inner.finished.insert(key.clone());
        inner.queues.remove(&key);
        inner.queued.remove(&key);
        inner.assignments.remove(&key);
        Ok(())
    }

    async fn is_finished(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read();
        Ok(inner.finished.contains(&key(workflow_id, instance_id)))
    }
}

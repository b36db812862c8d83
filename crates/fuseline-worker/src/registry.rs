//! Workflow registry and environment entrypoint
//!
//! Workers resolve workflow locators against factories compiled into the
//! embedding binary. A locator either names a registry entry directly or a
//! broker repository whose workflow list is resolved against the same
//! registry; a repository's url and credentials are metadata only.

use std::collections::BTreeMap;
use std::sync::Arc;

use fuseline_core::Workflow;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::{BrokerClient, HttpBrokerClient};
use crate::worker::{Worker, WorkerError};

type WorkflowFactory = Box<dyn Fn() -> Workflow + Send + Sync>;

/// Named workflow factories known to this process.
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: BTreeMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Workflow + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a fresh workflow for `name`.
    pub fn resolve(&self, name: &str) -> Option<Workflow> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Resolve `locators` (registry entries or repository names) to registry
/// entry names, consulting the broker for repositories.
async fn resolve_locators(
    registry: &WorkflowRegistry,
    client: &dyn BrokerClient,
    locators: &[String],
) -> Result<Vec<String>, WorkerError> {
    let mut names = Vec::new();
    for locator in locators {
        if registry.contains(locator) {
            names.push(locator.clone());
            continue;
        }
        let repo = client
            .get_repository(locator)
            .await?
            .ok_or_else(|| WorkerError::UnknownRepository(locator.clone()))?;
        for workflow in repo.workflows {
            if !registry.contains(&workflow) {
                return Err(WorkerError::UnknownWorkflow(workflow));
            }
            names.push(workflow);
        }
    }
    Ok(names)
}

/// Run workers against the broker named by the environment.
///
/// Env surface: `BROKER_URL` (default `http://localhost:8000`),
/// `WORKER_PROCESSES` (default 1, the number of concurrent worker tasks)
/// and `LOG_LEVEL` (default `info`; ignored when the embedding binary has
/// already installed a subscriber).
pub async fn run_from_env(
    registry: &WorkflowRegistry,
    locators: &[String],
) -> Result<(), WorkerError> {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    let base_url =
        std::env::var("BROKER_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let processes: usize = std::env::var("WORKER_PROCESSES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
        .max(1);

    let client: Arc<dyn BrokerClient> = Arc::new(HttpBrokerClient::new(&base_url));
    let names = resolve_locators(registry, client.as_ref(), locators).await?;

    let mut handles = Vec::with_capacity(processes);
    for _ in 0..processes {
        let workflows: Vec<Workflow> = names
            .iter()
            .map(|name| {
                registry
                    .resolve(name)
                    .ok_or_else(|| WorkerError::UnknownWorkflow(name.clone()))
            })
            .collect::<Result<_, _>>()?;
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let worker = Worker::connect(client, workflows).await?;
            worker.work(true).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|err| WorkerError::Join(err.to_string()))??;
    }
    Ok(())
}

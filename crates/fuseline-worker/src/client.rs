//! Broker clients
//!
//! Workers talk to the broker through [`BrokerClient`]: either directly in
//! process ([`LocalBrokerClient`]) or over HTTP ([`HttpBrokerClient`]).
//! The HTTP client retries transport failures and broker 5xx responses with
//! exponential backoff before surfacing an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fuseline_broker::{
    Broker, BrokerError, DispatchResponse, RepositoryInfo, StepAssignment, StepReport, WorkerInfo,
    WorkerIdResponse,
};
use fuseline_core::WorkflowSchema;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Broker-side rejection (schema mismatch, unknown instance, storage).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker could not be reached after retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker answered with an unexpected status or body.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Client-side interface used by workers to communicate with the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn register_worker(&self, schemas: &[WorkflowSchema]) -> Result<String, ClientError>;

    async fn dispatch_workflow(
        &self,
        schema: &WorkflowSchema,
        inputs: Option<Map<String, Value>>,
    ) -> Result<String, ClientError>;

    async fn get_step(&self, worker_id: &str) -> Result<Option<StepAssignment>, ClientError>;

    async fn report_step(&self, worker_id: &str, report: StepReport) -> Result<(), ClientError>;

    async fn keep_alive(&self, worker_id: &str) -> Result<(), ClientError>;

    async fn register_repository(&self, repo: &RepositoryInfo) -> Result<(), ClientError>;

    async fn get_repository(&self, name: &str) -> Result<Option<RepositoryInfo>, ClientError>;

    async fn list_repositories(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RepositoryInfo>, ClientError>;

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, ClientError>;
}

/// Client that directly calls a [`Broker`] instance.
pub struct LocalBrokerClient {
    broker: Arc<Broker>,
}

impl LocalBrokerClient {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[async_trait]
impl BrokerClient for LocalBrokerClient {
    async fn register_worker(&self, schemas: &[WorkflowSchema]) -> Result<String, ClientError> {
        Ok(self.broker.register_worker(schemas)?)
    }

    async fn dispatch_workflow(
        &self,
        schema: &WorkflowSchema,
        inputs: Option<Map<String, Value>>,
    ) -> Result<String, ClientError> {
        Ok(self.broker.dispatch_workflow(schema, inputs).await?)
    }

    async fn get_step(&self, worker_id: &str) -> Result<Option<StepAssignment>, ClientError> {
        Ok(self.broker.get_step(worker_id).await?)
    }

    async fn report_step(&self, worker_id: &str, report: StepReport) -> Result<(), ClientError> {
        Ok(self.broker.report_step(worker_id, report).await?)
    }

    async fn keep_alive(&self, worker_id: &str) -> Result<(), ClientError> {
        self.broker.keep_alive(worker_id);
        Ok(())
    }

    async fn register_repository(&self, repo: &RepositoryInfo) -> Result<(), ClientError> {
        self.broker.register_repository(repo.clone());
        Ok(())
    }

    async fn get_repository(&self, name: &str) -> Result<Option<RepositoryInfo>, ClientError> {
        Ok(self.broker.get_repository(name))
    }

    async fn list_repositories(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RepositoryInfo>, ClientError> {
        Ok(self.broker.list_repositories(page, page_size))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, ClientError> {
        Ok(self.broker.list_workers())
    }
}

const MAX_RETRIES: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Client that communicates with a remote HTTP broker.
pub struct HttpBrokerClient {
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpBrokerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
            max_retries: MAX_RETRIES,
        }
    }

    /// Override the transport retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue a request, retrying transport failures and 5xx responses with
    /// exponential backoff.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut delay = BASE_DELAY;
        let mut attempt = 0;
        loop {
            let retryable = match build(&self.client).send().await {
                Ok(response) if response.status().is_server_error() => {
                    format!("broker returned {}", response.status())
                }
                Ok(response) => return Ok(response),
                Err(err) => err.to_string(),
            };
            if attempt >= self.max_retries {
                return Err(ClientError::Transport(retryable));
            }
            tracing::warn!(
                error = %retryable,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "broker request failed; backing off"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_DELAY);
            attempt += 1;
        }
    }

    async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Protocol(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn register_worker(&self, schemas: &[WorkflowSchema]) -> Result<String, ClientError> {
        let url = self.url("/worker/register");
        let response = self.send(|c| c.post(&url).json(schemas)).await?;
        let response = Self::expect_ok(response).await?;
        let body: WorkerIdResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(body.worker_id)
    }

    async fn dispatch_workflow(
        &self,
        schema: &WorkflowSchema,
        inputs: Option<Map<String, Value>>,
    ) -> Result<String, ClientError> {
        let url = self.url("/workflow/dispatch");
        let body = json!({ "workflow": schema, "inputs": inputs });
        let response = self.send(|c| c.post(&url).json(&body)).await?;
        let response = Self::expect_ok(response).await?;
        let body: DispatchResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(body.instance_id)
    }

    async fn get_step(&self, worker_id: &str) -> Result<Option<StepAssignment>, ClientError> {
        let url = self.url("/workflow/step");
        let response = self
            .send(|c| c.get(&url).query(&[("worker_id", worker_id)]))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = Self::expect_ok(response).await?;
        let assignment: StepAssignment = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(Some(assignment))
    }

    async fn report_step(&self, worker_id: &str, report: StepReport) -> Result<(), ClientError> {
        let url = self.url("/workflow/step");
        let response = self
            .send(|c| c.post(&url).query(&[("worker_id", worker_id)]).json(&report))
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn keep_alive(&self, worker_id: &str) -> Result<(), ClientError> {
        let url = self.url("/worker/keep-alive");
        let response = self
            .send(|c| c.post(&url).query(&[("worker_id", worker_id)]))
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn register_repository(&self, repo: &RepositoryInfo) -> Result<(), ClientError> {
        let url = self.url("/repository/register");
        let response = self.send(|c| c.post(&url).json(repo)).await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn get_repository(&self, name: &str) -> Result<Option<RepositoryInfo>, ClientError> {
        let url = self.url("/repository");
        let response = self.send(|c| c.get(&url).query(&[("name", name)])).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_ok(response).await?;
        let repo: RepositoryInfo = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(Some(repo))
    }

    async fn list_repositories(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RepositoryInfo>, ClientError> {
        let url = self.url("/repository");
        let response = self
            .send(|c| {
                c.get(&url).query(&[
                    ("page", page.to_string()),
                    ("page_size", page_size.to_string()),
                ])
            })
            .await?;
        let response = Self::expect_ok(response).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, ClientError> {
        let url = self.url("/workers");
        let response = self.send(|c| c.get(&url)).await?;
        let response = Self::expect_ok(response).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

//! # Fuseline broker
//!
//! The broker catalogues workflow schemas, tracks worker liveness, accepts
//! dispatch requests, leases ready steps to eligible workers and drives
//! dependency resolution on completion. Instance state is persisted through
//! a [`fuseline_storage::RuntimeStorage`]; this crate adds the scheduling
//! logic and the HTTP surface.

mod broker;
mod http;
mod types;

pub use broker::{Broker, BrokerError, DEFAULT_LEASE, DEFAULT_WORKER_TTL};
pub use http::{router, ApiError, AppState, DispatchRequest, DispatchResponse, WorkerIdResponse};
pub use types::{
    LastTask, RepositoryInfo, StepAssignment, StepPayload, StepReport, WorkerInfo, WorkflowInfo,
};

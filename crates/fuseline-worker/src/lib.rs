//! # Fuseline worker
//!
//! The execution side of the engine: broker clients, the
//! poll -> lease -> execute -> report loop, and the registry-backed
//! entrypoint for worker processes.
//!
//! A worker holds fully built [`fuseline_core::Workflow`]s. Their schemas
//! are registered with the broker at connect time; assignments then
//! reference steps by stable name and the worker maps them back onto local
//! handlers.

mod client;
mod registry;
mod worker;

pub use client::{BrokerClient, ClientError, HttpBrokerClient, LocalBrokerClient};
pub use registry::{run_from_env, WorkflowRegistry};
pub use worker::{dispatch, Worker, WorkerError};

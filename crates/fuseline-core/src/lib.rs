//! # Fuseline core
//!
//! Building blocks of the Fuseline workflow engine: the graph model with
//! typed dependencies and OR-groups, the policy framework wrapping step
//! execution, the serializable workflow schema, the local in-process
//! executor, the tracing sink and the YAML exporter.
//!
//! ## Example
//!
//! ```
//! use fuseline_core::prelude::*;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let mut builder = WorkflowBuilder::new("greet");
//! let hello = builder.add_step(StepSpec::new(FnStep::new("Hello", |args: StepArgs| async move {
//!     let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("world");
//!     Ok(json!(format!("hello {name}")))
//! })).param(ParamSpec::plain("name")));
//! builder.output(hello);
//! let mut workflow = builder.build().unwrap();
//!
//! let mut inputs = serde_json::Map::new();
//! inputs.insert("name".to_string(), json!("fuseline"));
//! let result = workflow.run(inputs).await;
//! assert_eq!(result, Some(json!("hello fuseline")));
//! # });
//! ```

pub mod error;
pub mod executor;
pub mod export;
pub mod graph;
pub mod policy;
pub mod schema;
pub mod status;
pub mod step;
pub mod trace;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{GraphError, StepError};
    pub use crate::executor::{LocalExecutor, StepOutcome};
    pub use crate::export::{Exporter, YamlExporter};
    pub use crate::graph::{ParamSpec, StepId, StepSpec, Workflow, WorkflowBuilder};
    pub use crate::policy::{
        FailureDecision, PolicyRegistry, PolicySpec, RetryPolicy, StepPolicy, TimeoutPolicy,
        WorkflowPolicy,
    };
    pub use crate::schema::{SeedParam, StepSchema, StepSeed, WorkflowSchema};
    pub use crate::status::Status;
    pub use crate::step::{FnStep, StepArgs, StepHandler};
    pub use crate::trace::{BoundTracer, FileTracer, MemoryTracer, TraceEvent, Tracer};
}

pub use error::{GraphError, StepError};
pub use executor::{LocalExecutor, StepOutcome};
pub use export::{ExportError, Exporter, YamlExporter};
pub use graph::{ConditionFn, ParamSpec, StepId, StepNode, StepSpec, Workflow, WorkflowBuilder};
pub use policy::{
    FailureDecision, PolicyKind, PolicyRegistry, PolicySpec, RetryPolicy, StepContext, StepFuture,
    StepPolicy, TimeoutPolicy, WorkflowPolicy,
};
pub use schema::{SeedParam, StepSchema, StepSeed, WorkflowSchema};
pub use status::Status;
pub use step::{FnStep, StepArgs, StepHandler};
pub use trace::{BoundTracer, FileTracer, MemoryTracer, TraceEvent, Tracer};

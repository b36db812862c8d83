//! Error types shared across the core

/// Errors raised while building or reconstructing a workflow graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The graph contains a dependency cycle.
    #[error("dependency cycle involving step {0}")]
    Cycle(String),

    /// A step was registered but is not in the closure of the declared outputs.
    #[error("step {0} is not reachable from the declared outputs")]
    Unreachable(String),

    /// Two steps were given the same name.
    #[error("duplicate step name: {0}")]
    DuplicateName(String),

    /// A workflow was built without declared outputs.
    #[error("workflow has no declared outputs")]
    NoOutputs,

    /// A schema or seed referenced a step name that does not exist.
    #[error("unknown step name: {0}")]
    UnknownName(String),

    /// A schema referenced a policy name missing from the registry.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// A policy configuration could not be interpreted.
    #[error("invalid config for policy {name}: {message}")]
    PolicyConfig { name: String, message: String },
}

/// Error produced by a step execution.
///
/// This is the boundary between user code and the policy chain: handlers
/// return it instead of panicking, and `on_failure` consumes it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// The step exceeded a timeout policy's deadline.
    #[error("step exceeded {seconds}s")]
    Timeout { seconds: f64 },

    /// A declared dependency value was missing from the execution payload.
    #[error("missing dependency value: {0}")]
    MissingDependency(String),

    /// The user function failed.
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Build a generic failure from any displayable error.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

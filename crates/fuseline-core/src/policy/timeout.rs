//! Timeout policy

use std::time::Duration;

use serde_json::{json, Value};

use super::{StepContext, StepFuture, StepPolicy};
use crate::error::{GraphError, StepError};

/// Enforces a hard deadline on each step invocation.
///
/// On deadline the call resolves to [`StepError::Timeout`], which a retry
/// policy further out in the chain may then consume. The broker also reads
/// this policy's config off the wire schema to size the assignment lease.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    seconds: f64,
}

impl TimeoutPolicy {
    pub fn new(limit: Duration) -> Self {
        Self {
            seconds: limit.as_secs_f64(),
        }
    }

    /// Deadline in seconds.
    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    pub(crate) fn from_config(config: &Value) -> Result<Self, GraphError> {
        let seconds = config
            .get("seconds")
            .and_then(Value::as_f64)
            .ok_or_else(|| GraphError::PolicyConfig {
                name: "timeout".to_string(),
                message: "missing numeric field `seconds`".to_string(),
            })?;
        Ok(Self { seconds })
    }
}

impl StepPolicy for TimeoutPolicy {
    fn name(&self) -> &str {
        "timeout"
    }

    fn config(&self) -> Value {
        json!({ "seconds": self.seconds })
    }

    fn wrap<'a>(&self, _step: &StepContext<'_>, call: StepFuture<'a>) -> StepFuture<'a> {
        let limit = Duration::from_secs_f64(self.seconds.max(0.0));
        let seconds = self.seconds;
        Box::pin(async move {
            match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout { seconds }),
            }
        })
    }
}

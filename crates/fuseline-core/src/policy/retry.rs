//! Retry policy

use std::time::Duration;

use serde_json::{json, Value};

use super::{FailureDecision, StepContext, StepPolicy};
use crate::error::StepError;

/// Re-runs a failing step a fixed number of times with a fixed wait.
///
/// `max_retries` counts attempts, not retries: `max_retries = 2` allows one
/// re-run after the initial failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            wait: Duration::ZERO,
        }
    }

    /// Set the delay between attempts.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub(crate) fn from_config(config: &Value) -> Self {
        let max_retries = config
            .get("max_retries")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        let wait = config.get("wait").and_then(Value::as_f64).unwrap_or(0.0);
        Self {
            max_retries,
            wait: Duration::from_secs_f64(wait.max(0.0)),
        }
    }
}

impl StepPolicy for RetryPolicy {
    fn name(&self) -> &str {
        "retry"
    }

    fn config(&self) -> Value {
        json!({
            "max_retries": self.max_retries,
            "wait": self.wait.as_secs_f64(),
        })
    }

    fn on_failure(
        &self,
        _step: &StepContext<'_>,
        _error: &StepError,
        attempt: u32,
    ) -> Option<FailureDecision> {
        if attempt + 1 < self.max_retries {
            Some(FailureDecision::Retry { delay: self.wait })
        } else {
            Some(FailureDecision::Fail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext<'static> {
        StepContext {
            name: "step0",
            label: "Test",
            attempt: 0,
        }
    }

    #[test]
    fn retries_until_exhausted() {
        let policy = RetryPolicy::new(3).with_wait(Duration::from_millis(10));
        let err = StepError::failed("boom");

        assert_eq!(
            policy.on_failure(&ctx(), &err, 0),
            Some(FailureDecision::Retry {
                delay: Duration::from_millis(10)
            })
        );
        assert_eq!(
            policy.on_failure(&ctx(), &err, 1),
            Some(FailureDecision::Retry {
                delay: Duration::from_millis(10)
            })
        );
        assert_eq!(policy.on_failure(&ctx(), &err, 2), Some(FailureDecision::Fail));
    }

    #[test]
    fn single_attempt_never_retries() {
        let policy = RetryPolicy::new(1);
        let err = StepError::failed("boom");
        assert_eq!(policy.on_failure(&ctx(), &err, 0), Some(FailureDecision::Fail));
    }

    #[test]
    fn config_round_trip() {
        let policy = RetryPolicy::new(4).with_wait(Duration::from_millis(250));
        let rebuilt = RetryPolicy::from_config(&policy.config());
        assert_eq!(rebuilt.max_retries, 4);
        assert_eq!(rebuilt.wait, Duration::from_millis(250));
    }
}

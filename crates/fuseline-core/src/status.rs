//! Execution status for workflow steps and workflows

use serde::{Deserialize, Serialize};

/// Lifecycle state of a step or workflow run.
///
/// Steps move `Pending -> Running -> {Succeeded, Failed, Skipped}`.
/// `Cancelled` is only entered from `Pending` when the owning run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl Status {
    /// Whether this state satisfies downstream dependencies.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Parse the wire string form (`"PENDING"`, `"RUNNING"`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Wire string form, shared with the relational adapter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Stage and pipeline status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of one stage within a pipeline run.
///
/// `Pending -> Running -> {Succeeded, Failed}`. A stage that is never
/// attempted because an upstream stage failed goes straight from `Pending`
/// to `Failed` with [`FailureCause::UpstreamFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed and published its outputs.
    Succeeded,
    /// Failed, or not attempted because an upstream stage failed.
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageState {
    /// Returns true if the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if `next` is a legal transition from this state.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Why a stage ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FailureCause {
    /// The stage ran and its execution failed.
    Executed,
    /// The stage was not attempted because an upstream stage failed.
    UpstreamFailed {
        /// The stage whose failure made this one unreachable.
        upstream: String,
    },
}

/// Overall result of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every terminal stage succeeded.
    Succeeded,
    /// At least one terminal stage failed.
    Failed,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

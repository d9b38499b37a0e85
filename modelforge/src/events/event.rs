//! Lifecycle events emitted while a pipeline runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The lifecycle points the pipeline reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A stage began executing.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage finished and published its outputs.
    #[serde(rename = "stage.succeeded")]
    StageSucceeded,
    /// A stage was attempted and failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A stage was skipped because an upstream stage failed.
    #[serde(rename = "stage.not_attempted")]
    StageNotAttempted,
    /// Every stage reached a terminal state.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
}

impl EventKind {
    /// The dotted event type string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StageStarted => "stage.started",
            Self::StageSucceeded => "stage.succeeded",
            Self::StageFailed => "stage.failed",
            Self::StageNotAttempted => "stage.not_attempted",
            Self::PipelineCompleted => "pipeline.completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// What happened.
    pub kind: EventKind,
    /// The pipeline run this belongs to.
    pub run_id: Uuid,
    /// The stage, for stage events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Event-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates a stage-scoped event with an empty payload.
    #[must_use]
    pub fn stage(kind: EventKind, run_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            kind,
            run_id,
            stage: Some(stage.into()),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Creates a pipeline-scoped event.
    #[must_use]
    pub fn pipeline(kind: EventKind, run_id: Uuid) -> Self {
        Self {
            kind,
            run_id,
            stage: None,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

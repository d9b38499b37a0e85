//! Records of what a stage invocation did.

use super::descriptor::CommandKind;
use super::work_area::TemplatePlacement;
use crate::core::{ArtifactRef, StageState};
use crate::errors::StageFailure;
use crate::process::{Invocation, ProcessOutput};
use crate::templates::{Template, TemplateSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One finished external invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Command label from the descriptor.
    pub label: String,
    /// Exit-status semantics.
    pub kind: CommandKind,
    /// Rendered command line.
    pub command: String,
    /// Exit code; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Captured stdout, decoded lossily.
    pub stdout: String,
    /// Captured stderr, decoded lossily.
    pub stderr: String,
    /// Work-area file holding the raw stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    /// Work-area file holding the raw stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,
}

impl CommandRecord {
    /// Builds a record from an invocation and its output.
    #[must_use]
    pub fn new(label: &str, kind: CommandKind, invocation: &Invocation, output: &ProcessOutput) -> Self {
        Self {
            label: label.to_string(),
            kind,
            command: invocation.command_line(),
            exit_code: output.exit_code,
            duration_ms: output.duration_ms,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            stdout_file: None,
            stderr_file: None,
        }
    }

    /// Returns true if the process exited with code zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A template as it was placed in the work area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    /// Template name.
    pub name: String,
    /// Content fingerprint.
    pub fingerprint: String,
    /// Where it came from.
    pub source: TemplateSource,
    /// What happened on placement.
    pub placement: TemplatePlacement,
}

impl TemplateRecord {
    /// Records a placed template.
    #[must_use]
    pub fn new(template: &Template, placement: TemplatePlacement) -> Self {
        Self {
            name: template.name.clone(),
            fingerprint: template.fingerprint.clone(),
            source: template.source.clone(),
            placement,
        }
    }
}

/// JSON record of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Pipeline run.
    pub run_id: Uuid,
    /// Stage name.
    pub stage: String,
    /// Final state.
    pub status: StageState,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Input artifacts consumed, as `stage.role`.
    pub inputs: Vec<String>,
    /// Optional input files that were absent.
    #[serde(default)]
    pub skipped_inputs: Vec<String>,
    /// Templates placed.
    pub templates: Vec<TemplateRecord>,
    /// Commands run, in order.
    pub commands: Vec<CommandRecord>,
    /// Roles published.
    pub published: Vec<String>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    /// Retained work area, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_area: Option<PathBuf>,
}

impl StageReport {
    /// Starts a report for a running stage.
    #[must_use]
    pub fn begin(run_id: Uuid, stage: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            stage: stage.into(),
            status: StageState::Running,
            started_at: now,
            finished_at: now,
            inputs: Vec::new(),
            skipped_inputs: Vec::new(),
            templates: Vec::new(),
            commands: Vec::new(),
            published: Vec::new(),
            failure: None,
            work_area: None,
        }
    }

    /// Milliseconds between start and finish.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Marks the report finished with `status`.
    pub fn finish(&mut self, status: StageState) {
        self.status = status;
        self.finished_at = Utc::now();
    }

    /// Converts to a JSON value.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Result of a successful stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Stage name.
    pub stage: String,
    /// Artifacts published, in descriptor order.
    pub published: Vec<ArtifactRef>,
    /// The stage report.
    pub report: StageReport,
}

impl StageOutcome {
    /// Finds a published artifact by role.
    #[must_use]
    pub fn artifact(&self, role: &str) -> Option<&ArtifactRef> {
        self.published.iter().find(|a| a.role == role)
    }
}

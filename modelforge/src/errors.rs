//! Error types for the modelforge pipeline.
//!
//! Every failure class is terminal for the stage that raised it. Nothing here
//! is retried automatically; errors carry enough context (stage, command,
//! captured stderr) to be diagnosed after the fact.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the pipeline.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A required upstream artifact, or a required file inside it, is missing.
    #[error("Artifact not found: stage '{stage}' role '{role}'{} at {}", file_suffix(.file.as_deref()), .path.display())]
    ArtifactNotFound {
        /// The stage expected to produce the artifact.
        stage: String,
        /// The artifact role.
        role: String,
        /// The missing file, if the artifact exists but is incomplete.
        file: Option<String>,
        /// The path that was checked.
        path: PathBuf,
    },

    /// A template is missing from the bundle and has no usable fallback.
    #[error("Template '{name}' not found (tried: {})", join_paths(.tried))]
    TemplateNotFound {
        /// The template name.
        name: String,
        /// Every location that was tried, in resolution order.
        tried: Vec<PathBuf>,
    },

    /// The native toolchain returned a non-zero exit code.
    #[error("Compilation failed: `{command}` exited with {}", exit_label(.exit_code))]
    CompilationFailed {
        /// The failing command line.
        command: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The model-to-source converter failed or produced nothing.
    #[error("Conversion failed: `{command}`: {reason}")]
    ConversionFailed {
        /// The failing command line.
        command: String,
        /// Why the conversion is considered failed.
        reason: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Any other fatal external command returned a non-zero exit code.
    #[error("Command failed: `{command}` exited with {}", exit_label(.exit_code))]
    CommandFailed {
        /// The failing command line.
        command: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A bounded external invocation exceeded its budget and was killed.
    #[error("Timeout: `{command}` did not finish within {timeout_secs}s")]
    Timeout {
        /// The command line that was killed.
        command: String,
        /// The budget in seconds.
        timeout_secs: f64,
    },

    /// An external process could not be started at all.
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn {
        /// The command line.
        command: String,
        /// The OS-level reason.
        reason: String,
    },

    /// Publishing or writing an artifact failed.
    #[error("Write error at {}: {reason}", .path.display())]
    WriteError {
        /// The destination path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn file_suffix(file: Option<&str>) -> String {
    file.map(|f| format!(" file '{f}'")).unwrap_or_default()
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
}

fn join_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "<nothing>".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    /// Creates an artifact-not-found error for a whole role.
    #[must_use]
    pub fn artifact_not_found(stage: impl Into<String>, role: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::ArtifactNotFound {
            stage: stage.into(),
            role: role.into(),
            file: None,
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates an artifact-not-found error for one file of a role.
    #[must_use]
    pub fn file_not_found(
        stage: impl Into<String>,
        role: impl Into<String>,
        file: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Self {
        Self::ArtifactNotFound {
            stage: stage.into(),
            role: role.into(),
            file: Some(file.into()),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates a write error from an IO failure.
    #[must_use]
    pub fn write_error(path: impl AsRef<Path>, err: &std::io::Error) -> Self {
        Self::WriteError {
            path: path.as_ref().to_path_buf(),
            reason: err.to_string(),
        }
    }

    /// Returns a stable machine-readable code for the error class.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::CycleDetected(_) => "CYCLE_DETECTED",
            Self::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            Self::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            Self::CompilationFailed { .. } => "COMPILATION_FAILED",
            Self::ConversionFailed { .. } => "CONVERSION_FAILED",
            Self::CommandFailed { .. } => "COMMAND_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::WriteError { .. } => "WRITE_ERROR",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Internal(_) => "INTERNAL",
            Self::Io(_) => "IO",
        }
    }

    /// Returns the failing command line, for classes raised by an external process.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::CompilationFailed { command, .. }
            | Self::ConversionFailed { command, .. }
            | Self::CommandFailed { command, .. }
            | Self::Timeout { command, .. }
            | Self::Spawn { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Returns the captured standard error, for classes that carry one.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::CompilationFailed { stderr, .. }
            | Self::ConversionFailed { stderr, .. }
            | Self::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Returns true if the failure was raised before any external process was spawned.
    #[must_use]
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound { .. } | Self::TemplateNotFound { .. } | Self::Validation(_) | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A failure attributed to exactly one stage and, when applicable, one external invocation.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {source}")]
pub struct StageError {
    /// The failing stage.
    pub stage: String,
    /// The underlying error.
    #[source]
    pub source: PipelineError,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, source: PipelineError) -> Self {
        Self {
            stage: stage.into(),
            source,
        }
    }

    /// Returns the failing command line, if an external invocation failed.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.source.command()
    }

    /// Returns the captured stderr, if any.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        self.source.stderr()
    }

    /// Converts to a serializable failure summary.
    #[must_use]
    pub fn to_failure(&self) -> StageFailure {
        StageFailure {
            stage: self.stage.clone(),
            code: self.source.code().to_string(),
            message: self.source.to_string(),
            command: self.command().map(String::from),
            stderr: self.stderr().map(String::from),
        }
    }
}

/// Serializable summary of a stage failure, kept in reports and pipeline results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// The failing stage.
    pub stage: String,
    /// Error class code (see [`PipelineError::code`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// The failing command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Captured standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl StageFailure {
    /// Creates the failure recorded for a stage that was never attempted.
    #[must_use]
    pub fn upstream(stage: impl Into<String>, upstream: &str) -> Self {
        Self {
            stage: stage.into(),
            code: "UPSTREAM_FAILED".to_string(),
            message: format!("Not attempted: upstream stage '{upstream}' failed"),
            command: None,
            stderr: None,
        }
    }
}

/// Contract codes attached to validation errors.
pub mod codes {
    /// A dependency names a stage that does not exist.
    pub const MISSING_DEP: &str = "CONTRACT-004-MISSING_DEP";
    /// A stage depends on itself.
    pub const SELF_DEP: &str = "CONTRACT-004-SELF_DEP";
    /// The dependency graph has a cycle.
    pub const CYCLE: &str = "CONTRACT-004-CYCLE";
    /// Two stages share a name.
    pub const CONFLICT: &str = "CONTRACT-004-CONFLICT";
    /// The pipeline has no stages.
    pub const EMPTY: &str = "CONTRACT-004-EMPTY";
    /// Two stages publish the same role.
    pub const ROLE_CONFLICT: &str = "CONTRACT-004-ROLE_CONFLICT";
    /// An input role is not published by any transitive dependency.
    pub const UNBOUND_INPUT: &str = "CONTRACT-004-UNBOUND_INPUT";
    /// A stage descriptor is internally inconsistent.
    pub const DESCRIPTOR: &str = "CONTRACT-001-DESCRIPTOR";
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline or descriptor validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if one was attached.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|i| i.code.as_str())
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", .cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            codes::CYCLE,
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        PipelineValidationError {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

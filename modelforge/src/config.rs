//! Pipeline configuration.
//!
//! Loaded from a JSON file, then overridden by `MODELFORGE_*` environment
//! variables. Every field has a default, so an empty object is a valid config.

use crate::errors::PipelineError;
use crate::observability::LogFormat;
use crate::stages::{CommandKind, FileRequirement};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MODELFORGE_";

/// What happens to a work area once its stage finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkAreaPolicy {
    /// Always delete.
    #[default]
    Remove,
    /// Always keep.
    Retain,
    /// Keep only when the stage failed.
    RetainOnFailure,
}

impl WorkAreaPolicy {
    /// Whether a work area should survive a stage with the given result.
    #[must_use]
    pub fn retains(self, succeeded: bool) -> bool {
        match self {
            Self::Remove => false,
            Self::Retain => true,
            Self::RetainOnFailure => !succeeded,
        }
    }
}

/// How independent stages are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One stage at a time, in topological order.
    Sequential,
    /// Siblings run concurrently once their dependencies succeed.
    #[default]
    Concurrent,
}

/// Whether the CSV test fixtures must be present downstream of training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixturePolicy {
    /// Missing fixtures fail the stage before anything runs.
    Required,
    /// Missing fixtures are logged and skipped.
    #[default]
    Optional,
}

impl FixturePolicy {
    /// The file requirement applied to the CSV fixtures.
    #[must_use]
    pub fn requirement(self) -> FileRequirement {
        match self {
            Self::Required => FileRequirement::Required,
            Self::Optional => FileRequirement::Optional,
        }
    }
}

/// External programs the stages invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// C compiler.
    #[serde(default = "default_cc")]
    pub cc: String,
    /// Model-to-source converter.
    #[serde(default = "default_converter")]
    pub converter: String,
    /// Section size inspector.
    #[serde(default = "default_size")]
    pub size: String,
    /// Shell used for build scripts.
    #[serde(default = "default_sh")]
    pub sh: String,
    /// Symbol stripper.
    #[serde(default = "default_strip")]
    pub strip: String,
}

fn default_cc() -> String {
    "cc".to_string()
}

fn default_converter() -> String {
    "onnx2c".to_string()
}

fn default_size() -> String {
    "size".to_string()
}

fn default_sh() -> String {
    "sh".to_string()
}

fn default_strip() -> String {
    "strip".to_string()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cc: default_cc(),
            converter: default_converter(),
            size: default_size(),
            sh: default_sh(),
            strip: default_strip(),
        }
    }
}

/// The external training command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Program to run.
    #[serde(default = "default_train_program")]
    pub program: String,
    /// Arguments.
    #[serde(default = "default_train_args")]
    pub args: Vec<String>,
    /// Directory holding the training scripts, copied into the work area.
    #[serde(default)]
    pub script_dir: Option<PathBuf>,
    /// Script files taken from `script_dir`.
    #[serde(default = "default_train_scripts")]
    pub scripts: Vec<String>,
}

fn default_train_program() -> String {
    "python".to_string()
}

fn default_train_args() -> Vec<String> {
    vec!["run.py".to_string(), "--output_dir".to_string(), ".".to_string()]
}

fn default_train_scripts() -> Vec<String> {
    vec!["run.py".to_string()]
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            program: default_train_program(),
            args: default_train_args(),
            script_dir: None,
            scripts: default_train_scripts(),
        }
    }
}

/// Per-kind budgets for external commands, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Training.
    #[serde(default = "default_train_secs")]
    pub train_secs: f64,
    /// Model-to-source conversion.
    #[serde(default = "default_convert_secs")]
    pub convert_secs: f64,
    /// Compilation and build scripts.
    #[serde(default = "default_build_secs")]
    pub build_secs: f64,
    /// Running built binaries and inspection tools.
    #[serde(default = "default_execute_secs")]
    pub execute_secs: f64,
}

fn default_train_secs() -> f64 {
    3600.0
}

fn default_convert_secs() -> f64 {
    300.0
}

fn default_build_secs() -> f64 {
    300.0
}

fn default_execute_secs() -> f64 {
    60.0
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            train_secs: default_train_secs(),
            convert_secs: default_convert_secs(),
            build_secs: default_build_secs(),
            execute_secs: default_execute_secs(),
        }
    }
}

impl StageTimeouts {
    /// The budget for a command of the given kind.
    #[must_use]
    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        let secs = match kind {
            CommandKind::Train => self.train_secs,
            CommandKind::Convert => self.convert_secs,
            CommandKind::Build => self.build_secs,
            CommandKind::Execute => self.execute_secs,
        };
        // `validate` rejects budgets that do not fit; unvalidated ones saturate.
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn all(&self) -> [(&'static str, f64); 4] {
        [
            ("train_secs", self.train_secs),
            ("convert_secs", self.convert_secs),
            ("build_secs", self.build_secs),
            ("execute_secs", self.execute_secs),
        ]
    }
}

/// Directories that replace the embedded template bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOverrides {
    /// Replacement for the compile-and-test bundle.
    #[serde(default)]
    pub compile_test: Option<PathBuf>,
    /// Replacement for the minimal-binary bundle.
    #[serde(default)]
    pub minimal_binary: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, used in job specs and logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Root of the artifact store.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Parent directory for work areas; the system temp dir when unset.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    /// Work-area cleanup.
    #[serde(default)]
    pub work_area_policy: WorkAreaPolicy,
    /// Scheduling of sibling stages.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// CSV fixture requirement.
    #[serde(default)]
    pub fixture_policy: FixturePolicy,
    /// External programs.
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    /// Training command.
    #[serde(default)]
    pub train: TrainConfig,
    /// Command budgets.
    #[serde(default)]
    pub timeouts: StageTimeouts,
    /// Template bundle overrides.
    #[serde(default)]
    pub templates: TemplateOverrides,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_name() -> String {
    "modelforge".to_string()
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            artifact_root: default_artifact_root(),
            work_root: None,
            work_area_policy: WorkAreaPolicy::default(),
            execution_mode: ExecutionMode::default(),
            fixture_policy: FixturePolicy::default(),
            toolchain: ToolchainConfig::default(),
            train: TrainConfig::default(),
            timeouts: StageTimeouts::default(),
            templates: TemplateOverrides::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the JSON is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Loads an optional file, then applies the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` on unreadable files or invalid override values.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env_overrides(std::env::vars())
    }

    /// Applies `MODELFORGE_*` overrides from the given variables.
    ///
    /// # Errors
    ///
    /// Returns `Config` if an override value cannot be parsed.
    pub fn with_env_overrides<I>(mut self, vars: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "NAME" => self.name = value,
                "ARTIFACT_ROOT" => self.artifact_root = PathBuf::from(value),
                "WORK_ROOT" => self.work_root = Some(PathBuf::from(value)),
                "WORK_AREA_POLICY" => self.work_area_policy = parse_enum(&key, &value)?,
                "EXECUTION_MODE" => self.execution_mode = parse_enum(&key, &value)?,
                "FIXTURE_POLICY" => self.fixture_policy = parse_enum(&key, &value)?,
                "LOG_FORMAT" => self.log_format = value.parse()?,
                "CC" => self.toolchain.cc = value,
                "CONVERTER" => self.toolchain.converter = value,
                "SIZE" => self.toolchain.size = value,
                "SH" => self.toolchain.sh = value,
                "STRIP" => self.toolchain.strip = value,
                "TRAIN_PROGRAM" => self.train.program = value,
                "TRAIN_SCRIPT_DIR" => self.train.script_dir = Some(PathBuf::from(value)),
                "TRAIN_TIMEOUT_SECS" => self.timeouts.train_secs = parse_secs(&key, &value)?,
                "CONVERT_TIMEOUT_SECS" => self.timeouts.convert_secs = parse_secs(&key, &value)?,
                "BUILD_TIMEOUT_SECS" => self.timeouts.build_secs = parse_secs(&key, &value)?,
                "EXECUTE_TIMEOUT_SECS" => self.timeouts.execute_secs = parse_secs(&key, &value)?,
                "COMPILE_TEST_TEMPLATES" => self.templates.compile_test = Some(PathBuf::from(value)),
                "MINIMAL_BINARY_TEMPLATES" => self.templates.minimal_binary = Some(PathBuf::from(value)),
                _ => tracing::debug!(variable = %key, "Ignoring unknown override"),
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks that programs are named and budgets are positive.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("name must not be empty".into()));
        }
        let programs = [
            ("toolchain.cc", &self.toolchain.cc),
            ("toolchain.converter", &self.toolchain.converter),
            ("toolchain.size", &self.toolchain.size),
            ("toolchain.sh", &self.toolchain.sh),
            ("toolchain.strip", &self.toolchain.strip),
            ("train.program", &self.train.program),
        ];
        for (field, program) in programs {
            if program.trim().is_empty() {
                return Err(PipelineError::Config(format!("{field} must not be empty")));
            }
        }
        for (field, secs) in self.timeouts.all() {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(PipelineError::Config(format!(
                    "timeouts.{field} must be a positive, representable duration, got {secs}"
                )));
            }
        }
        Ok(())
    }

    /// Sets the artifact root.
    #[must_use]
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    /// Sets the work root.
    #[must_use]
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    /// Sets the work-area policy.
    #[must_use]
    pub fn with_work_area_policy(mut self, policy: WorkAreaPolicy) -> Self {
        self.work_area_policy = policy;
        self
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Sets the fixture policy.
    #[must_use]
    pub fn with_fixture_policy(mut self, policy: FixturePolicy) -> Self {
        self.fixture_policy = policy;
        self
    }

    /// Replaces the toolchain.
    #[must_use]
    pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Replaces the training command.
    #[must_use]
    pub fn with_train(mut self, train: TrainConfig) -> Self {
        self.train = train;
        self
    }

    /// Replaces the command budgets.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The directory work areas are created under.
    #[must_use]
    pub fn resolved_work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn parse_enum<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, PipelineError> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| PipelineError::Config(format!("{key}: unsupported value '{value}'")))
}

fn parse_secs(key: &str, value: &str) -> Result<f64, PipelineError> {
    value
        .parse::<f64>()
        .map_err(|_| PipelineError::Config(format!("{key}: expected seconds, got '{value}'")))
}

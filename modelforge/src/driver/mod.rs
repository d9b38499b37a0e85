//! Job submission.
//!
//! A [`JobSpec`] is the serializable description of a pipeline run: one
//! [`JobStage`] per stage with its command line, input bindings, outputs and
//! execution environment. A [`JobSubmitter`] turns a spec into a run.

use crate::config::PipelineConfig;
use crate::core::{PipelineStatus, StageState};
use crate::errors::PipelineError;
use crate::events::EventSink;
use crate::pipeline::{run_pipeline, standard_pipeline, PipelineGraph, PipelineResult};
use crate::process::ProcessRunner;
use crate::stages::{convert, train, StageDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Compute target used when none is given.
pub const DEFAULT_COMPUTE: &str = "cpu-cluster";

/// Environment of the training stage.
pub const TRAIN_ENVIRONMENT: &str = "pytorch-onnx-env";
/// Environment of the conversion stage.
pub const CONVERT_ENVIRONMENT: &str = "onnx2c-env";
/// Environment of the native build stages.
pub const NATIVE_ENVIRONMENT: &str = "gcc-env";

/// Default environment for a stage name.
#[must_use]
pub fn default_environment(stage: &str) -> &'static str {
    match stage {
        train::STAGE => TRAIN_ENVIRONMENT,
        convert::STAGE => CONVERT_ENVIRONMENT,
        _ => NATIVE_ENVIRONMENT,
    }
}

/// One input binding of a job stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    /// Producing stage.
    pub stage: String,
    /// Role within the producer.
    pub role: String,
}

/// One stage of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStage {
    /// Stage name.
    pub name: String,
    /// Commands joined with `&&`, as they would run in the work area.
    pub command: String,
    /// Upstream roles consumed.
    pub inputs: Vec<JobInput>,
    /// Roles published.
    pub outputs: Vec<String>,
    /// Execution environment reference.
    pub environment: String,
    /// Stages that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl JobStage {
    /// Describes a stage descriptor.
    #[must_use]
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Self {
        let cwd = Path::new(".");
        let command = descriptor
            .commands
            .iter()
            .map(|c| c.invocation(cwd).command_line())
            .collect::<Vec<_>>()
            .join(" && ");
        Self {
            name: descriptor.name.clone(),
            command,
            inputs: descriptor
                .inputs
                .iter()
                .map(|i| JobInput {
                    stage: i.stage.clone(),
                    role: i.role.clone(),
                })
                .collect(),
            outputs: descriptor.outputs.iter().map(|o| o.role.clone()).collect(),
            environment: default_environment(&descriptor.name).to_string(),
            depends_on: descriptor.dependencies.clone(),
        }
    }

    /// Sets the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

/// A submittable pipeline job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Pipeline name.
    pub name: String,
    /// Compute target.
    pub compute: String,
    /// Stages in execution order.
    pub stages: Vec<JobStage>,
}

impl JobSpec {
    /// Describes a validated graph with the default compute and environments.
    #[must_use]
    pub fn from_graph(graph: &PipelineGraph) -> Self {
        Self {
            name: graph.name().to_string(),
            compute: DEFAULT_COMPUTE.to_string(),
            stages: graph.descriptors().map(JobStage::from_descriptor).collect(),
        }
    }

    /// Describes the standard pipeline for a config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the graph does not validate.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self::from_graph(&standard_pipeline(config)?))
    }

    /// Sets the compute target.
    #[must_use]
    pub fn with_compute(mut self, compute: impl Into<String>) -> Self {
        self.compute = compute.into();
        self
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&JobStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Serializes to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the spec cannot be encoded.
    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    /// Parses a JSON job spec.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the JSON does not describe a job.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json).map_err(|e| PipelineError::Serialization(e.to_string()))
    }
}

/// Where a submitted job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted without running.
    Accepted,
    /// Ran and every sink stage succeeded.
    Succeeded,
    /// Ran and at least one sink stage failed.
    Failed,
}

impl From<PipelineStatus> for JobStatus {
    fn from(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Succeeded => Self::Succeeded,
            PipelineStatus::Failed => Self::Failed,
        }
    }
}

/// Returned by [`JobSubmitter::submit`].
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    /// Job id.
    pub job_id: Uuid,
    /// Job name.
    pub name: String,
    /// Current status.
    pub status: JobStatus,
    /// Per-stage states; empty until the job runs.
    pub stages: BTreeMap<String, StageState>,
    /// The full result, for in-process runs.
    #[serde(skip)]
    pub result: Option<PipelineResult>,
}

impl JobHandle {
    fn accepted(spec: &JobSpec) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            name: spec.name.clone(),
            status: JobStatus::Accepted,
            stages: BTreeMap::new(),
            result: None,
        }
    }

    fn completed(result: PipelineResult) -> Self {
        Self {
            job_id: result.run_id,
            name: result.name.clone(),
            status: result.status.into(),
            stages: result.stages.iter().map(|(n, r)| (n.clone(), r.state)).collect(),
            result: Some(result),
        }
    }

    /// State of one stage.
    #[must_use]
    pub fn state(&self, stage: &str) -> Option<StageState> {
        self.stages.get(stage).copied()
    }
}

/// Submits jobs.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Submits a job.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, PipelineError>;
}

/// Runs the standard pipeline in this process.
///
/// The spec must describe the same stages the config produces; its name
/// replaces the config's pipeline name.
#[derive(Debug, Clone)]
pub struct LocalSubmitter {
    config: PipelineConfig,
    runner: Arc<dyn ProcessRunner>,
    sink: Arc<dyn EventSink>,
}

impl LocalSubmitter {
    /// Creates a local submitter.
    #[must_use]
    pub fn new(config: PipelineConfig, runner: Arc<dyn ProcessRunner>, sink: Arc<dyn EventSink>) -> Self {
        Self { config, runner, sink }
    }
}

#[async_trait]
impl JobSubmitter for LocalSubmitter {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, PipelineError> {
        let mut config = self.config.clone();
        config.name.clone_from(&spec.name);

        let expected = JobSpec::from_config(&config)?;
        if expected.stage_names() != spec.stage_names() {
            return Err(PipelineError::Config(format!(
                "job '{}' lists stages {:?}, local pipeline has {:?}",
                spec.name,
                spec.stage_names(),
                expected.stage_names()
            )));
        }

        info!(job = %spec.name, compute = %spec.compute, "Running job locally");
        let result = run_pipeline(&config, Arc::clone(&self.runner), self.sink.as_ref()).await?;
        Ok(JobHandle::completed(result))
    }
}

/// Accepts jobs without running them, optionally writing each spec to disk.
#[derive(Debug, Default)]
pub struct DryRunSubmitter {
    output_dir: Option<PathBuf>,
    submitted: Mutex<Vec<String>>,
}

impl DryRunSubmitter {
    /// Creates a submitter that keeps specs in memory only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also writes `<job name>.json` under `dir`.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// JSON of every accepted spec.
    #[must_use]
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl JobSubmitter for DryRunSubmitter {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, PipelineError> {
        let json = spec.to_json()?;
        if let Some(dir) = &self.output_dir {
            check_job_name(&spec.name)?;
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::write_error(dir, &e))?;
            let path = dir.join(format!("{}.json", spec.name));
            tokio::fs::write(&path, &json)
                .await
                .map_err(|e| PipelineError::write_error(&path, &e))?;
        }
        let handle = JobHandle::accepted(spec);
        info!(job = %spec.name, job_id = %handle.job_id, stages = spec.stages.len(), "Dry run accepted");
        self.submitted.lock().push(json);
        Ok(handle)
    }
}

/// Job names become file names under the dry-run output directory.
fn check_job_name(name: &str) -> Result<(), PipelineError> {
    let plain = !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "." && name != "..";
    if plain {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("Job name '{name}' must be a plain file name")))
    }
}

//! The four-stage model-to-binary pipeline.

use super::{PipelineBuilder, PipelineGraph, PipelineResult};
use crate::artifacts::LocalArtifactStore;
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, PipelineValidationError};
use crate::events::EventSink;
use crate::process::ProcessRunner;
use crate::stages::{compile_test, convert, minimal_binary, train, StageExecutor};
use std::sync::Arc;
use tracing::info;

/// Builds `train -> convert -> {compile_test, build_minimal}` from a config.
///
/// # Errors
///
/// Returns a validation error if the descriptors disagree with each other.
pub fn standard_pipeline(config: &PipelineConfig) -> Result<PipelineGraph, PipelineValidationError> {
    PipelineBuilder::new(&config.name)
        .stage(train::descriptor(config))?
        .stage(convert::descriptor(config))?
        .stage(compile_test::descriptor(config))?
        .stage(minimal_binary::descriptor(config))?
        .build()
}

/// Validates the config, opens the artifact store and runs the standard
/// pipeline with the configured execution mode.
///
/// # Errors
///
/// Returns an error for an invalid config, an unusable artifact root or an
/// invalid graph. Stage failures are reported in the result.
pub async fn run_pipeline(
    config: &PipelineConfig,
    runner: Arc<dyn ProcessRunner>,
    sink: &dyn EventSink,
) -> Result<PipelineResult, PipelineError> {
    config.validate()?;
    let graph = standard_pipeline(config)?;
    let store = Arc::new(LocalArtifactStore::new(&config.artifact_root)?);
    let executor = StageExecutor::from_config(config, store, runner);
    info!(
        pipeline = %graph.name(),
        artifact_root = %config.artifact_root.display(),
        mode = ?config.execution_mode,
        "Running pipeline"
    );
    Ok(graph.execute(&executor, config.execution_mode, sink).await)
}

//! Test assertions for pipeline results.

use crate::core::{FailureCause, StageState};
use crate::pipeline::PipelineResult;

/// Asserts that a stage ended in `expected`.
pub fn assert_stage_state(result: &PipelineResult, stage: &str, expected: StageState) {
    assert_eq!(
        result.state(stage),
        Some(expected),
        "Stage '{stage}': expected {expected}, got {:?} (failure: {:?})",
        result.state(stage),
        result.failure(stage)
    );
}

/// Asserts that a stage succeeded.
pub fn assert_stage_succeeded(result: &PipelineResult, stage: &str) {
    assert_stage_state(result, stage, StageState::Succeeded);
}

/// Asserts that a stage ran and failed with the given error code.
pub fn assert_stage_failed_with(result: &PipelineResult, stage: &str, code: &str) {
    assert_stage_state(result, stage, StageState::Failed);
    let record = &result.stages[stage];
    assert_eq!(record.cause, Some(FailureCause::Executed), "Stage '{stage}' never ran");
    let actual = record.failure.as_ref().map(|f| f.code.as_str());
    assert_eq!(actual, Some(code), "Stage '{stage}' failed with the wrong code");
}

/// Asserts that a stage was skipped because `upstream` failed.
pub fn assert_not_attempted(result: &PipelineResult, stage: &str, upstream: &str) {
    assert_stage_state(result, stage, StageState::Failed);
    assert_eq!(
        result.stages[stage].cause,
        Some(FailureCause::UpstreamFailed {
            upstream: upstream.to_string()
        }),
        "Stage '{stage}' should be attributed to '{upstream}'"
    );
}

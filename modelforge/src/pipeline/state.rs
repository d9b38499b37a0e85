//! Per-stage state tracking for one pipeline run.

use crate::core::{FailureCause, StageState};
use crate::errors::{StageError, StageFailure};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What is known about one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Current state.
    pub state: StageState,
    /// Why it failed, once it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    /// Failure details, once it has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            state: StageState::Pending,
            cause: None,
            failure: None,
        }
    }
}

/// Shared state table; transitions outside the legal lifecycle are ignored
/// and logged.
#[derive(Debug, Default)]
pub struct StateTable {
    records: RwLock<BTreeMap<String, StageRecord>>,
}

impl StateTable {
    /// Creates a table with every stage `Pending`.
    #[must_use]
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = stages.into_iter().map(|s| (s.into(), StageRecord::default())).collect();
        Self {
            records: RwLock::new(records),
        }
    }

    /// Current state of a stage.
    #[must_use]
    pub fn state(&self, stage: &str) -> Option<StageState> {
        self.records.read().get(stage).map(|r| r.state)
    }

    /// Full record of a stage.
    #[must_use]
    pub fn record(&self, stage: &str) -> Option<StageRecord> {
        self.records.read().get(stage).cloned()
    }

    /// `Pending -> Running`.
    pub fn mark_running(&self, stage: &str) -> bool {
        self.transition(stage, StageState::Running, None, None)
    }

    /// `Running -> Succeeded`.
    pub fn mark_succeeded(&self, stage: &str) -> bool {
        self.transition(stage, StageState::Succeeded, None, None)
    }

    /// `Running -> Failed` with the executor's error.
    pub fn mark_failed(&self, stage: &str, error: &StageError) -> bool {
        self.transition(stage, StageState::Failed, Some(FailureCause::Executed), Some(error.to_failure()))
    }

    /// `Pending -> Failed` without running, attributing the failure to `upstream`.
    pub fn mark_not_attempted(&self, stage: &str, upstream: &str) -> bool {
        self.transition(
            stage,
            StageState::Failed,
            Some(FailureCause::UpstreamFailed {
                upstream: upstream.to_string(),
            }),
            Some(StageFailure::upstream(stage, upstream)),
        )
    }

    /// The stage whose execution caused `stage` to fail: itself if it ran,
    /// the recorded upstream otherwise.
    #[must_use]
    pub fn root_failure(&self, stage: &str) -> Option<String> {
        let records = self.records.read();
        match records.get(stage)?.cause.as_ref()? {
            FailureCause::Executed => Some(stage.to_string()),
            FailureCause::UpstreamFailed { upstream } => Some(upstream.clone()),
        }
    }

    /// Returns true once every stage is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.records.read().values().all(|r| r.state.is_terminal())
    }

    /// Stages in `state`, sorted.
    #[must_use]
    pub fn in_state(&self, state: StageState) -> Vec<String> {
        self.records
            .read()
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Copy of every record.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, StageRecord> {
        self.records.read().clone()
    }

    fn transition(
        &self,
        stage: &str,
        next: StageState,
        cause: Option<FailureCause>,
        failure: Option<StageFailure>,
    ) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(stage) else {
            tracing::warn!(stage, "State change for unknown stage");
            return false;
        };
        if !record.state.can_transition_to(next) {
            tracing::warn!(stage, from = %record.state, to = %next, "Illegal state transition ignored");
            return false;
        }
        record.state = next;
        record.cause = cause;
        record.failure = failure;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;

    #[test]
    fn test_lifecycle() {
        let table = StateTable::new(["train", "convert"]);
        assert_eq!(table.state("train"), Some(StageState::Pending));
        assert!(!table.all_terminal());

        assert!(table.mark_running("train"));
        assert!(table.mark_succeeded("train"));
        assert!(!table.mark_running("train"));

        assert!(table.mark_running("convert"));
        let err = StageError::new(
            "convert",
            PipelineError::ConversionFailed {
                command: "onnx2c model.onnx".into(),
                reason: "converter produced no output".into(),
                stderr: String::new(),
            },
        );
        assert!(table.mark_failed("convert", &err));
        assert!(table.all_terminal());

        let record = table.record("convert").unwrap();
        assert_eq!(record.cause, Some(FailureCause::Executed));
        assert_eq!(record.failure.unwrap().command.as_deref(), Some("onnx2c model.onnx"));
        assert_eq!(table.root_failure("convert").as_deref(), Some("convert"));
    }

    #[test]
    fn test_not_attempted_records_upstream() {
        let table = StateTable::new(["convert", "compile_test"]);
        assert!(table.mark_not_attempted("compile_test", "convert"));
        assert_eq!(table.state("compile_test"), Some(StageState::Failed));
        assert_eq!(table.root_failure("compile_test").as_deref(), Some("convert"));
        assert_eq!(table.in_state(StageState::Failed), vec!["compile_test"]);

        // Never ran, so it cannot also succeed.
        assert!(!table.mark_succeeded("compile_test"));
        assert!(!table.mark_running("unknown"));
    }
}

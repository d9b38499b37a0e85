//! DAG execution of stage descriptors.
//!
//! A stage starts once every dependency has succeeded. A stage with a failed
//! dependency is marked failed without running; siblings are unaffected.

use super::state::{StageRecord, StateTable};
use crate::config::ExecutionMode;
use crate::core::{FailureCause, PipelineStatus, StageState};
use crate::errors::{PipelineError, StageError, StageFailure};
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::observability::SpanTimer;
use crate::stages::{StageDescriptor, StageExecutor, StageOutcome};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Pipeline name.
    pub name: String,
    /// Run id shared by every stage report.
    pub run_id: Uuid,
    /// Overall status: succeeded only if every sink stage succeeded.
    pub status: PipelineStatus,
    /// Final state of every stage.
    pub stages: BTreeMap<String, StageRecord>,
    /// Outcomes of the stages that succeeded.
    #[serde(skip)]
    pub outcomes: BTreeMap<String, StageOutcome>,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

impl PipelineResult {
    /// Returns true if the pipeline succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// Final state of a stage.
    #[must_use]
    pub fn state(&self, stage: &str) -> Option<StageState> {
        self.stages.get(stage).map(|r| r.state)
    }

    /// Failure details of a stage.
    #[must_use]
    pub fn failure(&self, stage: &str) -> Option<&StageFailure> {
        self.stages.get(stage).and_then(|r| r.failure.as_ref())
    }

    /// Failures of stages that actually ran.
    pub fn executed_failures(&self) -> impl Iterator<Item = &StageFailure> {
        self.stages
            .values()
            .filter(|r| r.cause == Some(FailureCause::Executed))
            .filter_map(|r| r.failure.as_ref())
    }

    /// Converts to a JSON value.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A validated graph of stage descriptors.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    stages: HashMap<String, StageDescriptor>,
    execution_order: Vec<String>,
}

impl PipelineGraph {
    /// Creates a graph. Use [`PipelineBuilder`](super::PipelineBuilder) for validation.
    #[must_use]
    pub(crate) fn new(name: String, stages: HashMap<String, StageDescriptor>, stage_order: &[String]) -> Self {
        let execution_order = topological_sort(&stages, stage_order);
        Self {
            name,
            stages,
            execution_order,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Stage names, dependencies first.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Looks up a descriptor.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.get(name)
    }

    /// Descriptors in execution order.
    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.execution_order.iter().filter_map(|n| self.stages.get(n))
    }

    /// Stages nothing else depends on.
    #[must_use]
    pub fn sinks(&self) -> Vec<String> {
        let depended: HashSet<&str> = self
            .stages
            .values()
            .flat_map(|d| d.dependencies.iter().map(String::as_str))
            .collect();
        self.execution_order
            .iter()
            .filter(|n| !depended.contains(n.as_str()))
            .cloned()
            .collect()
    }

    /// Runs every stage.
    ///
    /// Stage failures never abort the run; they are recorded in the result.
    pub async fn execute(&self, executor: &StageExecutor, mode: ExecutionMode, sink: &dyn EventSink) -> PipelineResult {
        let run_id = executor.run_id();
        let span = info_span!("pipeline", pipeline = %self.name, %run_id, ?mode);
        self.run(executor, mode, sink).instrument(span).await
    }

    async fn run(&self, executor: &StageExecutor, mode: ExecutionMode, sink: &dyn EventSink) -> PipelineResult {
        let timer = SpanTimer::start(&self.name);
        let run_id = executor.run_id();
        let table = StateTable::new(self.execution_order.iter().cloned());
        let mut outcomes = BTreeMap::new();
        let mut active = FuturesUnordered::new();

        info!(stages = self.stages.len(), "Pipeline started");

        loop {
            let ready = self.settle(&table, run_id, sink);
            if mode == ExecutionMode::Sequential {
                let Some(name) = ready.into_iter().next() else {
                    break;
                };
                let (stage, result) = self.start(&name, executor, &table, run_id, sink).await;
                self.record(&table, &mut outcomes, stage, result, run_id, sink).await;
                continue;
            }

            for name in ready {
                active.push(self.start(&name, executor, &table, run_id, sink));
            }
            if table.all_terminal() {
                break;
            }
            let Some((stage, result)) = active.next().await else {
                break;
            };
            self.record(&table, &mut outcomes, stage, result, run_id, sink).await;
        }

        if !table.all_terminal() {
            warn!(pending = ?table.in_state(StageState::Pending), "Pipeline stopped with unreachable stages");
        }

        let stages = table.snapshot();
        for (name, record) in &stages {
            if !matches!(record.cause, Some(FailureCause::UpstreamFailed { .. })) {
                continue;
            }
            if let Some(descriptor) = self.stages.get(name) {
                if let Err(e) = executor.retract_previous(descriptor) {
                    warn!(stage = %name, error = %e, "Failed to retract outputs of a stage that was not attempted");
                }
            }
        }

        let sinks_ok = self
            .sinks()
            .iter()
            .all(|s| stages.get(s).is_some_and(|r| r.state == StageState::Succeeded));
        let status = if sinks_ok {
            PipelineStatus::Succeeded
        } else {
            PipelineStatus::Failed
        };
        let duration_ms = timer.finish();

        let failed: Vec<&String> = stages
            .iter()
            .filter(|(_, r)| r.state == StageState::Failed)
            .map(|(n, _)| n)
            .collect();
        sink.emit(
            &PipelineEvent::pipeline(EventKind::PipelineCompleted, run_id).with_data(serde_json::json!({
                "status": status,
                "failed_stages": failed,
                "duration_ms": duration_ms,
            })),
        )
        .await;
        info!(%status, duration_ms, "Pipeline finished");

        PipelineResult {
            name: self.name.clone(),
            run_id,
            status,
            stages,
            outcomes,
            duration_ms,
        }
    }

    /// Marks stages with a failed dependency as not attempted, then returns
    /// the pending stages whose dependencies all succeeded.
    fn settle(&self, table: &StateTable, run_id: Uuid, sink: &dyn EventSink) -> Vec<String> {
        let mut ready = Vec::new();
        for name in &self.execution_order {
            if table.state(name) != Some(StageState::Pending) {
                continue;
            }
            let Some(descriptor) = self.stages.get(name) else {
                continue;
            };
            let failed_dep = descriptor
                .dependencies
                .iter()
                .find(|d| table.state(d) == Some(StageState::Failed));
            if let Some(dep) = failed_dep {
                let upstream = table.root_failure(dep).unwrap_or_else(|| dep.clone());
                table.mark_not_attempted(name, &upstream);
                warn!(stage = %name, %upstream, "Stage not attempted");
                sink.try_emit(
                    &PipelineEvent::stage(EventKind::StageNotAttempted, run_id, name)
                        .with_data(serde_json::json!({ "upstream": upstream })),
                );
            } else if descriptor
                .dependencies
                .iter()
                .all(|d| table.state(d) == Some(StageState::Succeeded))
            {
                ready.push(name.clone());
            }
        }
        ready
    }

    /// Marks a stage running, announces it and spawns it.
    fn start(
        &self,
        name: &str,
        executor: &StageExecutor,
        table: &StateTable,
        run_id: Uuid,
        sink: &dyn EventSink,
    ) -> impl Future<Output = (String, Result<StageOutcome, StageError>)> {
        table.mark_running(name);
        sink.try_emit(&PipelineEvent::stage(EventKind::StageStarted, run_id, name));
        let descriptor = self.stages.get(name).cloned().unwrap_or_else(|| StageDescriptor::new(name));
        spawn_stage(executor.clone(), descriptor)
    }

    async fn record(
        &self,
        table: &StateTable,
        outcomes: &mut BTreeMap<String, StageOutcome>,
        stage: String,
        result: Result<StageOutcome, StageError>,
        run_id: Uuid,
        sink: &dyn EventSink,
    ) {
        match result {
            Ok(outcome) => {
                table.mark_succeeded(&stage);
                let roles: Vec<&str> = outcome.published.iter().map(|a| a.role.as_str()).collect();
                sink.emit(
                    &PipelineEvent::stage(EventKind::StageSucceeded, run_id, &stage).with_data(serde_json::json!({
                        "published": roles,
                        "duration_ms": outcome.report.duration_ms(),
                    })),
                )
                .await;
                outcomes.insert(stage, outcome);
            }
            Err(error) => {
                table.mark_failed(&stage, &error);
                let failure = error.to_failure();
                sink.emit(
                    &PipelineEvent::stage(EventKind::StageFailed, run_id, &stage)
                        .with_data(serde_json::to_value(&failure).unwrap_or_default()),
                )
                .await;
            }
        }
    }
}

/// Runs one stage on its own task; a panic becomes an `Internal` stage error.
fn spawn_stage(
    executor: StageExecutor,
    descriptor: StageDescriptor,
) -> impl Future<Output = (String, Result<StageOutcome, StageError>)> {
    let name = descriptor.name.clone();
    let handle = tokio::spawn(async move { executor.run(&descriptor).await });
    async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(StageError::new(
                name.clone(),
                PipelineError::Internal(format!("Stage task failed: {e}")),
            )),
        };
        (name, result)
    }
}

/// Dependencies-first order, stable with respect to insertion order.
fn topological_sort(stages: &HashMap<String, StageDescriptor>, stage_order: &[String]) -> Vec<String> {
    fn visit(
        node: &str,
        stages: &HashMap<String, StageDescriptor>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(descriptor) = stages.get(node) {
            for dep in &descriptor.dependencies {
                visit(dep, stages, visited, result);
            }
        }
        result.push(node.to_string());
    }

    let mut result = Vec::new();
    let mut visited = HashSet::new();
    for name in stage_order {
        visit(name, stages, &mut visited, &mut result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::{CommandKind, CommandSpec};

    fn stage(name: &str, deps: &[&str]) -> StageDescriptor {
        deps.iter().fold(
            StageDescriptor::new(name).with_command(CommandSpec::new("run", CommandKind::Execute, "true")),
            |d, dep| d.with_dependency(*dep),
        )
    }

    fn diamond() -> PipelineGraph {
        PipelineBuilder::new("diamond")
            .stage(stage("train", &[]))
            .unwrap()
            .stage(stage("convert", &["train"]))
            .unwrap()
            .stage(stage("compile_test", &["convert"]))
            .unwrap()
            .stage(stage("build_minimal", &["convert"]))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_topological_order_and_sinks() {
        let graph = diamond();
        assert_eq!(graph.stage_count(), 4);
        assert_eq!(graph.execution_order(), ["train", "convert", "compile_test", "build_minimal"]);
        assert_eq!(graph.sinks(), vec!["compile_test", "build_minimal"]);
        assert_eq!(graph.descriptors().count(), 4);
    }

    #[test]
    fn test_settle_marks_downstream_of_failure() {
        let graph = diamond();
        let table = StateTable::new(graph.execution_order().iter().cloned());
        let sink = crate::events::CollectingEventSink::new();

        assert_eq!(graph.settle(&table, Uuid::nil(), &sink), vec!["train"]);
        table.mark_running("train");
        table.mark_failed("train", &StageError::new("train", PipelineError::Internal("boom".into())));

        assert!(graph.settle(&table, Uuid::nil(), &sink).is_empty());
        assert_eq!(table.root_failure("convert").as_deref(), Some("train"));
        assert_eq!(table.root_failure("build_minimal").as_deref(), Some("train"));
        assert!(table.all_terminal());
        assert_eq!(sink.stages_with(EventKind::StageNotAttempted).len(), 3);
    }
}

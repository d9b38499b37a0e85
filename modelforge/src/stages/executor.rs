//! Runs one stage from its descriptor.

use super::descriptor::{CommandKind, CommandSpec, FileRequirement, StageDescriptor};
use super::report::{CommandRecord, StageOutcome, StageReport, TemplateRecord};
use super::work_area::{FileOrigin, WorkArea};
use crate::artifacts::{ArtifactStore, PublishFile};
use crate::config::{PipelineConfig, StageTimeouts, WorkAreaPolicy};
use crate::core::{files, ArtifactRef, StageState};
use crate::errors::{PipelineError, StageError};
use crate::observability::SpanTimer;
use crate::process::ProcessRunner;
use crate::templates::Template;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// An input file scheduled for copying into the work area.
#[derive(Debug)]
struct PlannedCopy {
    source: PathBuf,
    target: String,
    origin: FileOrigin,
}

/// Everything resolved before the work area exists.
#[derive(Debug, Default)]
struct Plan {
    copies: Vec<PlannedCopy>,
    templates: Vec<Template>,
}

/// Executes stage descriptors against an artifact store.
///
/// Roles left by an earlier run of the stage are retracted first. Inputs and
/// templates are resolved before the work area exists; a stage with a missing
/// required input never spawns a process.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn ProcessRunner>,
    work_root: PathBuf,
    timeouts: StageTimeouts,
    work_area_policy: WorkAreaPolicy,
    run_id: Uuid,
}

impl StageExecutor {
    /// Creates an executor with default budgets and the `Remove` policy.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, runner: Arc<dyn ProcessRunner>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runner,
            work_root: work_root.into(),
            timeouts: StageTimeouts::default(),
            work_area_policy: WorkAreaPolicy::default(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Creates an executor configured from a pipeline config.
    #[must_use]
    pub fn from_config(config: &PipelineConfig, store: Arc<dyn ArtifactStore>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self::new(store, runner, config.resolved_work_root())
            .with_timeouts(config.timeouts.clone())
            .with_work_area_policy(config.work_area_policy)
    }

    /// Sets the command budgets.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the default work-area policy.
    #[must_use]
    pub fn with_work_area_policy(mut self, policy: WorkAreaPolicy) -> Self {
        self.work_area_policy = policy;
        self
    }

    /// Sets the run id stamped on reports.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// The run id stamped on reports.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Runs one stage.
    ///
    /// # Errors
    ///
    /// Returns a `StageError` naming the stage and, for external failures,
    /// the command line and captured stderr.
    pub async fn run(&self, descriptor: &StageDescriptor) -> Result<StageOutcome, StageError> {
        let span = info_span!("stage", stage = %descriptor.name, run_id = %self.run_id);
        self.run_stage(descriptor).instrument(span).await
    }

    async fn run_stage(&self, descriptor: &StageDescriptor) -> Result<StageOutcome, StageError> {
        let name = descriptor.name.as_str();
        let fail = |e: PipelineError| StageError::new(name, e);

        descriptor.validate().map_err(|e| fail(e.into()))?;
        let timer = SpanTimer::start(name);
        let mut report = StageReport::begin(self.run_id, name);
        self.retract_previous(descriptor).map_err(fail)?;

        let plan = self.preflight(descriptor, &mut report).map_err(|e| {
            warn!(code = e.code(), error = %e, "Preflight failed; nothing was run");
            fail(e)
        })?;

        let mut work = WorkArea::create(&self.work_root, name).map_err(fail)?;
        let result = self.execute(descriptor, &plan, &mut work, &mut report).await;

        let policy = descriptor.work_area_policy.unwrap_or(self.work_area_policy);
        let retain = policy.retains(result.is_ok());
        if retain {
            report.work_area = Some(work.path().to_path_buf());
        }

        let outcome = match result {
            Ok(published) => {
                report.published = published.iter().map(|a| a.role.clone()).collect();
                report.finish(StageState::Succeeded);
                match self.publish_report(descriptor, &mut work, &report) {
                    Ok(()) => Ok(StageOutcome {
                        stage: name.to_string(),
                        published,
                        report,
                    }),
                    Err(e) => Err(fail(e)),
                }
            }
            Err(e) => {
                let stage_error = fail(e);
                report.failure = Some(stage_error.to_failure());
                report.finish(StageState::Failed);
                match self.publish_diagnostics(descriptor, &mut work, &report, &stage_error.source) {
                    Ok(artifact) => info!(path = %artifact.path.display(), "Published diagnostics"),
                    Err(publish_error) => error!(error = %publish_error, "Failed to publish diagnostics"),
                }
                Err(stage_error)
            }
        };

        work.finish(retain);
        let duration_ms = timer.finish();
        match &outcome {
            Ok(_) => info!(duration_ms, "Stage succeeded"),
            Err(e) => error!(duration_ms, code = e.source.code(), error = %e, "Stage failed"),
        }
        outcome
    }

    fn preflight(&self, descriptor: &StageDescriptor, report: &mut StageReport) -> Result<Plan, PipelineError> {
        let mut plan = Plan::default();
        let mut artifacts: Vec<ArtifactRef> = Vec::new();

        for input in &descriptor.inputs {
            let artifact = self.store.materialize(&input.stage, &input.role)?;
            for file in &input.files {
                match file.selector.select(&artifact.files) {
                    Some(source) => {
                        let target = file.target_name(source);
                        let origin = if descriptor.generated.contains(&target) {
                            FileOrigin::Generated
                        } else {
                            FileOrigin::Static
                        };
                        plan.copies.push(PlannedCopy {
                            source: artifact.file(source),
                            target,
                            origin,
                        });
                    }
                    None if file.requirement == FileRequirement::Required => {
                        return Err(PipelineError::file_not_found(
                            &input.stage,
                            &input.role,
                            file.selector.describe(),
                            &artifact.path,
                        ));
                    }
                    None => {
                        warn!(input = %input.key(), file = %file.selector.describe(), "Optional input missing; skipping");
                        report.skipped_inputs.push(format!("{}/{}", input.key(), file.selector.describe()));
                    }
                }
            }
            report.inputs.push(input.key());
            artifacts.push(artifact);
        }

        for spec in &descriptor.templates {
            let fallback = spec.fallback.as_ref().and_then(|(stage, role)| {
                artifacts
                    .iter()
                    .find(|a| a.stage == *stage && a.role == *role)
                    .map(|a| a.path.as_path())
            });
            plan.templates.push(descriptor.resolver().resolve_with_fallback(&spec.name, fallback)?);
        }

        debug!(copies = plan.copies.len(), templates = plan.templates.len(), "Preflight complete");
        Ok(plan)
    }

    /// Clears every role an earlier run of this stage may have left behind.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if a published role cannot be removed.
    pub fn retract_previous(&self, descriptor: &StageDescriptor) -> Result<(), PipelineError> {
        let roles = descriptor
            .outputs
            .iter()
            .map(|o| o.role.as_str())
            .chain([descriptor.report_role.as_str(), descriptor.diagnostics_role.as_str()]);
        for role in roles {
            self.store.retract(&descriptor.name, role)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        descriptor: &StageDescriptor,
        plan: &Plan,
        work: &mut WorkArea,
        report: &mut StageReport,
    ) -> Result<Vec<ArtifactRef>, PipelineError> {
        for copy in &plan.copies {
            work.copy_in(&copy.source, &copy.target, copy.origin)?;
        }
        for template in &plan.templates {
            let placement = work.place_template(template)?;
            report.templates.push(TemplateRecord::new(template, placement));
        }

        for command in &descriptor.commands {
            self.run_command(command, work, report).await?;
        }

        for finalizer in &descriptor.finalizers {
            debug!(finalizer = finalizer.name(), "Running finalizer");
            finalizer.finalize(work, &report.commands).await?;
        }
        work.track_produced()?;

        // Resolve every role before publishing any, so a missing file leaves nothing behind.
        let available = work.list_files()?;
        let mut batches = Vec::with_capacity(descriptor.outputs.len());
        for output in &descriptor.outputs {
            let mut entries = Vec::new();
            for file in &output.files {
                match file.selector.select(&available) {
                    Some(name) => entries.push(PublishFile::new(name, work.file(name))),
                    None if file.requirement == FileRequirement::Required => {
                        return Err(PipelineError::file_not_found(
                            &descriptor.name,
                            &output.role,
                            file.selector.describe(),
                            work.path(),
                        ));
                    }
                    None => debug!(role = %output.role, file = %file.selector.describe(), "Optional output absent"),
                }
            }
            batches.push((output.role.as_str(), entries));
        }

        let mut published = Vec::with_capacity(batches.len());
        for (role, entries) in batches {
            published.push(self.store.publish(&descriptor.name, role, &entries)?);
        }
        Ok(published)
    }

    async fn run_command(
        &self,
        command: &CommandSpec,
        work: &mut WorkArea,
        report: &mut StageReport,
    ) -> Result<(), PipelineError> {
        let invocation = command.invocation(work.path());
        let timeout = command.timeout.unwrap_or_else(|| self.timeouts.for_kind(command.kind));
        let command_line = invocation.command_line();
        info!(command = %command_line, kind = %command.kind, "Running command");

        let output = self.runner.run(&invocation, timeout).await?;
        let mut record = CommandRecord::new(&command.label, command.kind, &invocation, &output);
        if let Some(file) = &command.stdout_file {
            work.write(file, &output.stdout, FileOrigin::Produced)?;
            record.stdout_file = Some(file.clone());
        }
        if let Some(file) = &command.stderr_file {
            work.write(file, &output.stderr, FileOrigin::Produced)?;
            record.stderr_file = Some(file.clone());
        }
        report.commands.push(record);

        if output.success() {
            if command.kind == CommandKind::Convert && output.stdout.iter().all(u8::is_ascii_whitespace) {
                return Err(PipelineError::ConversionFailed {
                    command: command_line,
                    reason: "converter produced no output".to_string(),
                    stderr: output.stderr_lossy(),
                });
            }
            return Ok(());
        }

        match command.kind {
            CommandKind::Build => Err(PipelineError::CompilationFailed {
                command: command_line,
                exit_code: output.exit_code,
                stderr: output.stderr_lossy(),
            }),
            CommandKind::Convert => Err(PipelineError::ConversionFailed {
                command: command_line,
                reason: match output.exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by a signal".to_string(),
                },
                stderr: output.stderr_lossy(),
            }),
            CommandKind::Train => Err(PipelineError::CommandFailed {
                command: command_line,
                exit_code: output.exit_code,
                stderr: output.stderr_lossy(),
            }),
            CommandKind::Execute => {
                info!(command = %command_line, exit_code = ?output.exit_code, "Recorded non-zero exit");
                Ok(())
            }
        }
    }

    fn publish_report(
        &self,
        descriptor: &StageDescriptor,
        work: &mut WorkArea,
        report: &StageReport,
    ) -> Result<(), PipelineError> {
        let path = work.write(files::STAGE_REPORT, &serde_json::to_vec_pretty(report)?, FileOrigin::Produced)?;
        self.store
            .publish(&descriptor.name, &descriptor.report_role, &[PublishFile::new(files::STAGE_REPORT, path)])?;
        Ok(())
    }

    fn publish_diagnostics(
        &self,
        descriptor: &StageDescriptor,
        work: &mut WorkArea,
        report: &StageReport,
        error: &PipelineError,
    ) -> Result<ArtifactRef, PipelineError> {
        let mut entries = Vec::new();
        if matches!(
            error,
            PipelineError::CompilationFailed { .. } | PipelineError::ConversionFailed { .. }
        ) {
            let stderr = error.stderr().unwrap_or_default();
            let path = work.write(files::COMPILATION_ERROR, stderr.as_bytes(), FileOrigin::Produced)?;
            entries.push(PublishFile::new(files::COMPILATION_ERROR, path));
        }
        let path = work.write(files::STAGE_REPORT, &serde_json::to_vec_pretty(report)?, FileOrigin::Produced)?;
        entries.push(PublishFile::new(files::STAGE_REPORT, path));
        self.store.publish(&descriptor.name, &descriptor.diagnostics_role, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::LocalArtifactStore;
    use crate::core::roles;
    use crate::process::{MockProcessRunner, ProcessOutput};
    use crate::stages::descriptor::{InputFile, InputRole, OutputRole};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        store: Arc<LocalArtifactStore>,
        work_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let store = Arc::new(LocalArtifactStore::new(root.path().join("artifacts")).unwrap());
        let work_root = root.path().join("work");
        Fixture {
            _root: root,
            store,
            work_root,
        }
    }

    fn seed(fx: &Fixture, stage: &str, role: &str, entries: &[(&str, &str)]) {
        let src = TempDir::new().unwrap();
        let files: Vec<PublishFile> = entries
            .iter()
            .map(|(name, content)| {
                let path = src.path().join(name);
                fs::write(&path, content).unwrap();
                PublishFile::new(*name, path)
            })
            .collect();
        fx.store.publish(stage, role, &files).unwrap();
    }

    fn echo_descriptor() -> StageDescriptor {
        StageDescriptor::new("echo")
            .with_input(InputRole::new("up", "data").with_file(InputFile::required("in.txt")))
            .with_command(
                CommandSpec::new("echo", CommandKind::Execute, "cat")
                    .with_args(["in.txt"])
                    .capture_stdout("out.txt"),
            )
            .with_output(OutputRole::new("result").with_required("out.txt"))
    }

    #[tokio::test]
    async fn test_missing_input_never_spawns() {
        let fx = fixture();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().never();

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        let err = executor.run(&echo_descriptor()).await.unwrap_err();

        assert_eq!(err.stage, "echo");
        assert_eq!(err.source.code(), "ARTIFACT_NOT_FOUND");
        assert!(!fx.work_root.exists() || fs::read_dir(&fx.work_root).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_capture_and_publish() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "hello")]);

        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(ProcessOutput::new(0, "hello", "")));

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        let outcome = executor.run(&echo_descriptor()).await.unwrap();

        let result = outcome.artifact("result").unwrap();
        assert_eq!(fs::read_to_string(result.file("out.txt")).unwrap(), "hello");
        assert!(fx.store.contains("echo", roles::REPORT));
        assert_eq!(outcome.report.status, StageState::Succeeded);
        assert_eq!(outcome.report.commands.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_output_fails_without_publishing() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "hello")]);

        let descriptor = echo_descriptor().with_output(OutputRole::new("extra").with_required("never.bin"));
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|_, _| Ok(ProcessOutput::new(0, "hello", "")));

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        let err = executor.run(&descriptor).await.unwrap_err();

        assert_eq!(err.source.code(), "ARTIFACT_NOT_FOUND");
        assert!(!fx.store.contains("echo", "result"));
        assert!(fx.store.contains("echo", roles::DIAGNOSTICS));
    }

    #[tokio::test]
    async fn test_empty_converter_output_is_conversion_failure() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "x")]);

        let descriptor = StageDescriptor::new("convert")
            .with_input(InputRole::new("up", "data").with_file(InputFile::required("in.txt")))
            .with_command(CommandSpec::new("convert", CommandKind::Convert, "onnx2c").capture_stdout("gen.c"))
            .with_output(OutputRole::new("generated_source").with_required("gen.c"));

        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|_, _| Ok(ProcessOutput::new(0, " \n", "")));

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        let err = executor.run(&descriptor).await.unwrap_err();

        assert_eq!(err.source.code(), "CONVERSION_FAILED");
        assert!(!fx.store.contains("convert", "generated_source"));
        let diagnostics = fx.store.materialize("convert", roles::DIAGNOSTICS).unwrap();
        assert!(diagnostics.contains(files::COMPILATION_ERROR));
    }

    #[tokio::test]
    async fn test_timeout_fails_stage() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "x")]);

        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|inv, timeout| {
            Err(PipelineError::Timeout {
                command: inv.command_line(),
                timeout_secs: timeout.as_secs_f64(),
            })
        });

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        let err = executor.run(&echo_descriptor()).await.unwrap_err();
        assert_eq!(err.source.code(), "TIMEOUT");
        assert_eq!(err.command(), Some("cat in.txt"));
    }

    #[tokio::test]
    async fn test_retain_on_failure_keeps_work_area() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "x")]);

        let descriptor = echo_descriptor().with_work_area_policy(WorkAreaPolicy::RetainOnFailure);
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Err(PipelineError::Spawn { command: "cat".into(), reason: "gone".into() }));

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        assert!(executor.run(&descriptor).await.is_err());

        let kept: Vec<_> = fs::read_dir(&fx.work_root).unwrap().collect();
        assert_eq!(kept.len(), 1);
        let diagnostics = fx.store.materialize("echo", roles::DIAGNOSTICS).unwrap();
        let report: StageReport =
            serde_json::from_slice(&fs::read(diagnostics.file(files::STAGE_REPORT)).unwrap()).unwrap();
        assert_eq!(report.status, StageState::Failed);
        assert!(report.work_area.is_some());
    }

    #[tokio::test]
    async fn test_optional_input_skipped_and_recorded() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "x")]);

        let descriptor = StageDescriptor::new("echo")
            .with_input(
                InputRole::new("up", "data")
                    .with_file(InputFile::required("in.txt"))
                    .with_file(InputFile::optional("extra.csv")),
            )
            .with_command(CommandSpec::new("echo", CommandKind::Execute, "true"));

        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|_, _| Ok(ProcessOutput::new(0, "", "")));

        let executor = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root);
        let outcome = executor.run(&descriptor).await.unwrap();
        assert_eq!(outcome.report.skipped_inputs, vec!["up.data/extra.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_rerun_retracts_previous_outputs() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "hello")]);

        let mut healthy = MockProcessRunner::new();
        healthy.expect_run().returning(|_, _| Ok(ProcessOutput::new(0, "hello", "")));
        StageExecutor::new(fx.store.clone(), Arc::new(healthy), &fx.work_root)
            .run(&echo_descriptor())
            .await
            .unwrap();
        assert!(fx.store.contains("echo", "result"));

        let mut broken = MockProcessRunner::new();
        broken
            .expect_run()
            .returning(|_, _| Err(PipelineError::Spawn { command: "cat".into(), reason: "gone".into() }));
        StageExecutor::new(fx.store.clone(), Arc::new(broken), &fx.work_root)
            .run(&echo_descriptor())
            .await
            .unwrap_err();

        assert_eq!(fx.store.roles("echo"), vec![roles::DIAGNOSTICS.to_string()]);
    }

    #[tokio::test]
    async fn test_successful_rerun_retracts_previous_diagnostics() {
        let fx = fixture();
        seed(&fx, "up", "data", &[("in.txt", "hello")]);
        seed(&fx, "echo", roles::DIAGNOSTICS, &[(files::STAGE_REPORT, "{}")]);

        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|_, _| Ok(ProcessOutput::new(0, "hello", "")));
        StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root)
            .run(&echo_descriptor())
            .await
            .unwrap();

        assert_eq!(fx.store.roles("echo"), vec![roles::REPORT.to_string(), "result".to_string()]);
    }

    #[tokio::test]
    async fn test_preflight_failure_retracts_previous_outputs() {
        let fx = fixture();
        seed(&fx, "echo", "result", &[("out.txt", "old")]);
        seed(&fx, "echo", roles::REPORT, &[(files::STAGE_REPORT, "{}")]);

        let mut runner = MockProcessRunner::new();
        runner.expect_run().never();
        let err = StageExecutor::new(fx.store.clone(), Arc::new(runner), &fx.work_root)
            .run(&echo_descriptor())
            .await
            .unwrap_err();

        assert_eq!(err.source.code(), "ARTIFACT_NOT_FOUND");
        assert!(fx.store.roles("echo").is_empty());
    }
}

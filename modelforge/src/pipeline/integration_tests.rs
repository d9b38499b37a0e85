//! End-to-end tests of the four-stage pipeline.

#[cfg(test)]
mod tests {
    use crate::artifacts::ArtifactStore;
    use crate::config::{ExecutionMode, FixturePolicy, PipelineConfig, StageTimeouts, WorkAreaPolicy};
    use crate::core::{files, roles, PipelineStatus, StageState};
    use crate::events::{CollectingEventSink, EventKind};
    use crate::pipeline::{run_pipeline, PipelineResult};
    use crate::process::{MockProcessRunner, TokioProcessRunner};
    use crate::stages::{compile_test, convert, minimal_binary, train, TemplatePlacement, TemplateSpec};
    use crate::testing::{
        assert_not_attempted, assert_stage_failed_with, assert_stage_succeeded, ArtifactFixture, ScriptedResponse,
        ScriptedRunner,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const GENERATED: &str = "void entry(const float input[1][1], float output[1][1]) { output[0][0] = input[0][0]; }\n";

    const SIZE_OUTPUT: &str = "minimal_nn_stripped  :\n\
        section      size    addr\n\
        .text        1234    4096\n\
        .rodata       100    8192\n\
        .data          16   12288\n\
        .bss            8   12304\n\
        Total        1358\n";

    /// A toolchain where every program behaves.
    fn healthy_toolchain() -> ScriptedRunner {
        ScriptedRunner::new()
            .on(
                "python",
                ScriptedResponse::ok()
                    .with_stdout("Epoch 1/1 loss 0.01\n")
                    .with_file("model.onnx", "onnx-bytes")
                    .with_file(files::METRICS, "mse: 0.01\n")
                    .with_file(files::TEST_INPUT, "1.0\n2.0\n")
                    .with_file(files::EXPECTED_OUTPUT, "2.0\n4.0\n"),
            )
            .on("onnx2c", ScriptedResponse::ok().with_stdout(GENERATED))
            .on("cc", ScriptedResponse::ok().with_file(files::TEST_BINARY, "elf"))
            .on(
                "test_model",
                ScriptedResponse::ok()
                    .with_stdout("Loaded 2 test samples\n")
                    .with_file(files::TEST_RESULTS, "samples: 2\n"),
            )
            .on(
                "sh",
                ScriptedResponse::ok()
                    .with_stdout("unstripped_bytes: 16000\nstripped_bytes: 9000\n")
                    .with_file(files::MINIMAL_BINARY, "elf-unstripped")
                    .with_file(files::STRIPPED_BINARY, "elf"),
            )
            .on("size", ScriptedResponse::ok().with_stdout(SIZE_OUTPUT))
    }

    async fn run(config: &PipelineConfig, runner: Arc<ScriptedRunner>) -> PipelineResult {
        run_pipeline(config, runner, &CollectingEventSink::new()).await.unwrap()
    }

    fn states(result: &PipelineResult) -> Vec<(String, StageState)> {
        result.stages.iter().map(|(n, r)| (n.clone(), r.state)).collect()
    }

    #[tokio::test]
    async fn test_healthy_pipeline_publishes_every_role() {
        let fx = ArtifactFixture::new().unwrap();
        let runner = Arc::new(healthy_toolchain());
        let sink = CollectingEventSink::new();

        let result = run_pipeline(&fx.config(), runner.clone(), &sink).await.unwrap();

        assert!(result.succeeded(), "{:?}", result.stages);
        for stage in [train::STAGE, convert::STAGE, compile_test::STAGE, minimal_binary::STAGE] {
            assert_stage_succeeded(&result, stage);
            assert!(fx.has(stage, roles::REPORT));
        }
        assert_eq!(fx.read(convert::STAGE, roles::GENERATED_SOURCE, files::GENERATED_SOURCE).unwrap(), GENERATED.as_bytes());
        assert!(fx.has(convert::STAGE, roles::TEST_VECTORS));
        assert!(fx.has(compile_test::STAGE, roles::TEST_BINARY));
        assert!(fx.has(minimal_binary::STAGE, roles::DEPLOYMENT_BINARY));

        let report: serde_json::Value =
            serde_json::from_slice(&fx.read(minimal_binary::STAGE, roles::BUILD_REPORT, files::BUILD_REPORT).unwrap())
                .unwrap();
        assert_eq!(report["text"], 1234);
        assert_eq!(report["stripped_bytes"], 9000);

        assert_eq!(runner.calls_to("onnx2c")[0].args, vec![files::MODEL_ONNX]);
        assert_eq!(sink.stages_with(EventKind::StageSucceeded).len(), 4);
        assert_eq!(sink.of_kind(EventKind::PipelineCompleted).len(), 1);
    }

    #[tokio::test]
    async fn test_compile_failure_leaves_sibling_untouched() {
        let fx = ArtifactFixture::new().unwrap();
        let runner = Arc::new(
            healthy_toolchain().on(
                "cc",
                ScriptedResponse::exit(1).with_stderr("time_series_model.c:3: error: expected ';'\n"),
            ),
        );

        let result = run(&fx.config(), runner.clone()).await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_stage_failed_with(&result, compile_test::STAGE, "COMPILATION_FAILED");
        assert_stage_succeeded(&result, minimal_binary::STAGE);

        let failure = result.failure(compile_test::STAGE).unwrap();
        assert!(failure.message.contains("cc test_model.c time_series_model.c model_impl.c -o test_model -lm"));
        assert_eq!(
            fx.read(compile_test::STAGE, roles::DIAGNOSTICS, files::COMPILATION_ERROR).unwrap(),
            b"time_series_model.c:3: error: expected ';'\n"
        );
        assert!(!fx.has(compile_test::STAGE, roles::TEST_BINARY));
        assert!(!fx.has(compile_test::STAGE, roles::TEST_RESULTS));
        assert!(runner.calls_to("test_model").is_empty());
        assert_eq!(result.executed_failures().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_rerun_leaves_no_stale_outputs() {
        let fx = ArtifactFixture::new().unwrap();
        let first = run(&fx.config(), Arc::new(healthy_toolchain())).await;
        assert!(first.succeeded());
        assert!(fx.has(compile_test::STAGE, roles::TEST_RESULTS));

        let broken = Arc::new(healthy_toolchain().on("cc", ScriptedResponse::exit(1).with_stderr("error\n")));
        let second = run(&fx.config(), broken).await;

        assert_stage_failed_with(&second, compile_test::STAGE, "COMPILATION_FAILED");
        assert!(!fx.has(compile_test::STAGE, roles::TEST_RESULTS));
        assert!(!fx.has(compile_test::STAGE, roles::TEST_BINARY));
        assert!(!fx.has(compile_test::STAGE, roles::REPORT));
        assert!(fx.has(compile_test::STAGE, roles::DIAGNOSTICS));

        let third = run(&fx.config(), Arc::new(healthy_toolchain())).await;
        assert!(third.succeeded());
        assert!(!fx.has(compile_test::STAGE, roles::DIAGNOSTICS));
        assert!(fx.has(compile_test::STAGE, roles::TEST_RESULTS));

        let upstream_broken = Arc::new(healthy_toolchain().on("onnx2c", ScriptedResponse::exit(2)));
        let fourth = run(&fx.config(), upstream_broken).await;
        assert_not_attempted(&fourth, compile_test::STAGE, convert::STAGE);
        assert!(fx.store().roles(compile_test::STAGE).is_empty());
        assert!(fx.store().roles(minimal_binary::STAGE).is_empty());
    }

    #[tokio::test]
    async fn test_conversion_failure_is_not_attempted_downstream() {
        let fx = ArtifactFixture::new().unwrap();
        let runner = Arc::new(healthy_toolchain().on("onnx2c", ScriptedResponse::exit(2).with_stderr("bad opset")));
        let sink = CollectingEventSink::new();

        let result = run_pipeline(&fx.config(), runner.clone(), &sink).await.unwrap();

        assert_stage_succeeded(&result, train::STAGE);
        assert_stage_failed_with(&result, convert::STAGE, "CONVERSION_FAILED");
        assert_not_attempted(&result, compile_test::STAGE, convert::STAGE);
        assert_not_attempted(&result, minimal_binary::STAGE, convert::STAGE);
        assert!(fx.has(convert::STAGE, roles::DIAGNOSTICS));
        assert!(runner.calls_to("cc").is_empty());
        assert!(runner.calls_to("sh").is_empty());

        let mut skipped = sink.stages_with(EventKind::StageNotAttempted);
        skipped.sort();
        assert_eq!(skipped, vec![minimal_binary::STAGE, compile_test::STAGE]);
    }

    #[tokio::test]
    async fn test_training_failure_reaches_every_stage() {
        let fx = ArtifactFixture::new().unwrap();
        let runner = Arc::new(healthy_toolchain().on("python", ScriptedResponse::exit(1).with_stderr("CUDA error")));

        let result = run(&fx.config(), runner.clone()).await;

        assert_stage_failed_with(&result, train::STAGE, "COMMAND_FAILED");
        for stage in [convert::STAGE, compile_test::STAGE, minimal_binary::STAGE] {
            assert_not_attempted(&result, stage, train::STAGE);
        }
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_sequential_and_concurrent_agree() {
        let broken_cc = || healthy_toolchain().on("cc", ScriptedResponse::exit(1).with_stderr("boom"));

        let fx_seq = ArtifactFixture::new().unwrap();
        let seq_runner = Arc::new(broken_cc());
        let seq_config = fx_seq.config().with_execution_mode(ExecutionMode::Sequential);
        let sequential = run(&seq_config, seq_runner.clone()).await;

        let fx_con = ArtifactFixture::new().unwrap();
        let concurrent = run(&fx_con.config(), Arc::new(broken_cc())).await;

        assert_eq!(states(&sequential), states(&concurrent));
        let programs: Vec<String> = seq_runner.calls().into_iter().map(|c| c.program).collect();
        assert_eq!(programs, ["python", "onnx2c", "cc", "sh", "size"]);
    }

    #[tokio::test]
    async fn test_test_binary_exit_code_does_not_fail_stage() {
        let fx = ArtifactFixture::new().unwrap();
        let stdout = b"sample 0: expected 6.000000 got 5.000000\n\xff raw byte kept\n".to_vec();
        let runner = Arc::new(
            healthy_toolchain().on(
                "test_model",
                ScriptedResponse::exit(3).with_stdout(stdout.clone()).with_stderr("1 mismatch\n"),
            ),
        );

        let result = run(&fx.config(), runner).await;

        assert_stage_succeeded(&result, compile_test::STAGE);
        assert_eq!(fx.read(compile_test::STAGE, roles::TEST_RESULTS, files::TEST_OUTPUT).unwrap(), stdout);
        assert_eq!(fx.read(compile_test::STAGE, roles::TEST_RESULTS, files::TEST_ERRORS).unwrap(), b"1 mismatch\n");

        let report = &result.outcomes[compile_test::STAGE].report;
        assert_eq!(report.commands.last().unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_command_timeout_fails_stage() {
        let fx = ArtifactFixture::new().unwrap();
        let config = fx.config().with_timeouts(StageTimeouts {
            build_secs: 0.02,
            ..StageTimeouts::default()
        });
        let runner = Arc::new(healthy_toolchain().on(
            "cc",
            ScriptedResponse::ok().with_delay(Duration::from_secs(5)),
        ));

        let result = run(&config, runner).await;

        assert_stage_failed_with(&result, compile_test::STAGE, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_required_fixtures_fail_training_without_csvs() {
        let no_csv = || {
            healthy_toolchain().on("python", ScriptedResponse::ok().with_file("model.onnx", "onnx-bytes"))
        };

        let fx = ArtifactFixture::new().unwrap();
        let strict = fx.config().with_fixture_policy(FixturePolicy::Required);
        let result = run(&strict, Arc::new(no_csv())).await;
        assert_stage_failed_with(&result, train::STAGE, "ARTIFACT_NOT_FOUND");
        assert!(!fx.has(train::STAGE, roles::MODEL));

        let fx = ArtifactFixture::new().unwrap();
        let result = run(&fx.config(), Arc::new(no_csv())).await;
        assert!(result.succeeded());
        let skipped = &result.outcomes[convert::STAGE].report.skipped_inputs;
        assert_eq!(skipped.len(), 2, "{skipped:?}");
        assert!(fx.has(convert::STAGE, roles::TEST_VECTORS));
    }

    #[tokio::test]
    async fn test_missing_input_never_spawns() {
        let fx = ArtifactFixture::new().unwrap();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().never();
        let executor = fx.executor(&fx.config(), Arc::new(runner));

        let err = executor.run(&convert::descriptor(&fx.config())).await.unwrap_err();
        assert_eq!(err.source.code(), "ARTIFACT_NOT_FOUND");
        assert!(!fx.has(convert::STAGE, roles::DIAGNOSTICS));

        fx.seed(train::STAGE, roles::MODEL, &[("weights.bin", "x")]).unwrap();
        fx.seed::<&str>(train::STAGE, roles::TEST_VECTORS, &[]).unwrap();
        let err = executor.run(&convert::descriptor(&fx.config())).await.unwrap_err();
        assert_eq!(err.source.code(), "ARTIFACT_NOT_FOUND");
        assert!(err.to_string().contains("onnx"));
    }

    #[tokio::test]
    async fn test_templates_never_replace_generated_source() {
        let fx = ArtifactFixture::new().unwrap();
        let overrides = fx.path().join("templates");
        std::fs::create_dir_all(&overrides).unwrap();
        for name in [files::TEST_HARNESS, files::MODEL_HEADER, files::MODEL_IMPL, files::GENERATED_SOURCE] {
            std::fs::write(overrides.join(name), format!("/* template {name} */\n")).unwrap();
        }
        let mut config = fx.config();
        config.templates.compile_test = Some(overrides);

        fx.seed(
            convert::STAGE,
            roles::GENERATED_SOURCE,
            &[(files::GENERATED_SOURCE, GENERATED), (files::MODEL_IMPL, "/* upstream impl */\n")],
        )
        .unwrap();
        fx.seed::<&str>(convert::STAGE, roles::TEST_VECTORS, &[]).unwrap();

        let descriptor = compile_test::descriptor(&config)
            .with_template(TemplateSpec::bundled(files::GENERATED_SOURCE))
            .with_work_area_policy(WorkAreaPolicy::Retain);
        let runner = Arc::new(healthy_toolchain());
        let outcome = fx.executor(&config, runner).run(&descriptor).await.unwrap();

        let placement = |name: &str| {
            outcome
                .report
                .templates
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.placement)
        };
        assert_eq!(placement(files::GENERATED_SOURCE), Some(TemplatePlacement::SkippedGenerated));
        assert_eq!(placement(files::MODEL_IMPL), Some(TemplatePlacement::ReplacedStatic));
        assert_eq!(placement(files::TEST_HARNESS), Some(TemplatePlacement::Written));

        let work = outcome.report.work_area.clone().unwrap();
        assert_eq!(std::fs::read_to_string(work.join(files::GENERATED_SOURCE)).unwrap(), GENERATED);
        assert_eq!(
            std::fs::read_to_string(work.join(files::MODEL_IMPL)).unwrap(),
            "/* template model_impl.c */\n"
        );
        std::fs::remove_dir_all(work).unwrap();
    }

    fn on_path(program: &str) -> bool {
        std::env::var_os("PATH").is_some_and(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
    }

    /// Runs the compile-and-test stage with the real C compiler over a
    /// `sum(a, b)` model and a harness that expects `expected`.
    async fn compile_sum_harness(fx: &ArtifactFixture, expected: i32) -> crate::stages::StageOutcome {
        let harness = fx.path().join("harness");
        std::fs::create_dir_all(&harness).unwrap();
        std::fs::write(harness.join(files::MODEL_HEADER), "float sum(float a, float b);\n").unwrap();
        std::fs::write(
            harness.join(files::MODEL_IMPL),
            "#include \"time_series_model.h\"\n\nfloat twice(float a) { return sum(a, a); }\n",
        )
        .unwrap();
        std::fs::write(
            harness.join(files::TEST_HARNESS),
            format!(
                r#"#include <stdio.h>
#include "time_series_model.h"

int main(void) {{
    float got = sum(2.0f, 3.0f);
    FILE* results = fopen("test_results.txt", "w");
    if (results) {{
        fprintf(results, "expected: {expected}\ngot: %g\n", got);
        fclose(results);
    }}
    printf("sum(2, 3) = %g, expected {expected}\n", got);
    return got == {expected} ? 0 : 1;
}}
"#
            ),
        )
        .unwrap();

        let mut config = fx.config();
        config.templates.compile_test = Some(harness);
        fx.seed(
            convert::STAGE,
            roles::GENERATED_SOURCE,
            &[(files::GENERATED_SOURCE, "float sum(float a, float b) { return a + b; }\n")],
        )
        .unwrap();
        fx.seed::<&str>(convert::STAGE, roles::TEST_VECTORS, &[]).unwrap();

        fx.executor(&config, Arc::new(TokioProcessRunner::new()))
            .run(&compile_test::descriptor(&config))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_real_compiler_sum_harness() {
        if !on_path("cc") {
            eprintln!("skipping: no cc on PATH");
            return;
        }
        let fx = ArtifactFixture::new().unwrap();
        let outcome = compile_sum_harness(&fx, 5).await;

        let results = fx.read(compile_test::STAGE, roles::TEST_RESULTS, files::TEST_RESULTS).unwrap();
        assert_eq!(String::from_utf8(results).unwrap(), "expected: 5\ngot: 5\n");
        let stdout = fx.read(compile_test::STAGE, roles::TEST_RESULTS, files::TEST_OUTPUT).unwrap();
        assert!(String::from_utf8_lossy(&stdout).contains("sum(2, 3) = 5"));
        assert_eq!(outcome.report.commands.last().unwrap().exit_code, Some(0));
        assert!(fx.path().join("artifacts/compile_test/test_binary/test_model").is_file());
    }

    #[tokio::test]
    async fn test_real_compiler_mismatch_is_published_not_hidden() {
        if !on_path("cc") {
            eprintln!("skipping: no cc on PATH");
            return;
        }
        let fx = ArtifactFixture::new().unwrap();
        let outcome = compile_sum_harness(&fx, 6).await;

        let results = fx.read(compile_test::STAGE, roles::TEST_RESULTS, files::TEST_RESULTS).unwrap();
        assert_eq!(String::from_utf8(results).unwrap(), "expected: 6\ngot: 5\n");
        assert_eq!(outcome.report.commands.last().unwrap().exit_code, Some(1));
    }
}

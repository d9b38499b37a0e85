//! Deployment build: compiles the generated model into a size-optimized,
//! stripped binary and reports its footprint.

use super::convert;
use super::descriptor::{CommandKind, CommandSpec, InputFile, InputRole, OutputRole, StageDescriptor, TemplateSpec};
use super::finalizer::StageFinalizer;
use super::report::CommandRecord;
use super::size_report::SizeReport;
use super::work_area::{FileOrigin, WorkArea};
use crate::config::PipelineConfig;
use crate::core::{files, roles};
use crate::errors::PipelineError;
use crate::templates::TemplateBundle;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Stage name.
pub const STAGE: &str = "build_minimal";

/// Builds the deployment-binary descriptor.
#[must_use]
pub fn descriptor(config: &PipelineConfig) -> StageDescriptor {
    let toolchain = &config.toolchain;
    let bundle = config
        .templates
        .minimal_binary
        .clone()
        .map_or_else(TemplateBundle::minimal_binary, TemplateBundle::Directory);

    StageDescriptor::new(STAGE)
        .with_bundle(bundle)
        .with_input(InputRole::new(convert::STAGE, roles::GENERATED_SOURCE).with_file(InputFile::required(files::GENERATED_SOURCE)))
        .with_template(TemplateSpec::bundled(files::MINIMAL_EXAMPLE))
        .with_template(TemplateSpec::bundled(files::WRAPPER_HEADER))
        .with_template(TemplateSpec::bundled(files::BUILD_SCRIPT))
        .with_generated(files::GENERATED_SOURCE)
        .with_command(
            CommandSpec::new("build", CommandKind::Build, &toolchain.sh)
                .with_args([files::BUILD_SCRIPT])
                .with_env("CC", &toolchain.cc)
                .with_env("STRIP", &toolchain.strip)
                .capture_stdout(files::BUILD_OUTPUT)
                .capture_stderr(files::BUILD_ERRORS),
        )
        .with_command(
            CommandSpec::new("size", CommandKind::Execute, &toolchain.size)
                .with_args(["-A", files::STRIPPED_BINARY])
                .capture_stdout(files::SIZE_OUTPUT),
        )
        .with_finalizer(Arc::new(SizeReportFinalizer))
        .with_output(
            OutputRole::new(roles::DEPLOYMENT_BINARY)
                .with_required(files::MINIMAL_BINARY)
                .with_required(files::STRIPPED_BINARY),
        )
        .with_output(
            OutputRole::new(roles::BUILD_REPORT)
                .with_required(files::BUILD_OUTPUT)
                .with_required(files::BUILD_ERRORS)
                .with_required(files::SIZE_OUTPUT)
                .with_required(files::BUILD_REPORT)
                .with_required(files::README),
        )
}

/// Writes `build_report.json` and `README.md` from the size inspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeReportFinalizer;

#[async_trait]
impl StageFinalizer for SizeReportFinalizer {
    fn name(&self) -> &str {
        "size_report"
    }

    async fn finalize(&self, work_area: &mut WorkArea, records: &[CommandRecord]) -> Result<(), PipelineError> {
        let size_output = read_text(&work_area.file(files::SIZE_OUTPUT));
        let build_output = read_text(&work_area.file(files::BUILD_OUTPUT));

        let unstripped = reported_bytes(&build_output, "unstripped_bytes")
            .or_else(|| file_len(&work_area.file(files::MINIMAL_BINARY)));
        let stripped =
            reported_bytes(&build_output, "stripped_bytes").or_else(|| file_len(&work_area.file(files::STRIPPED_BINARY)));
        let report = SizeReport::parse(&size_output)?.with_file_sizes(unstripped, stripped);

        let size_exit = records.iter().find(|r| r.label == "size").and_then(|r| r.exit_code);
        debug!(?size_exit, sections = report.sections.len(), "Parsed section sizes");

        let json = serde_json::to_vec_pretty(&report.to_dict())?;
        work_area.write(files::BUILD_REPORT, &json, FileOrigin::Produced)?;
        work_area.write(files::README, readme(&report, records).as_bytes(), FileOrigin::Produced)?;

        info!(
            rom_bytes = report.rom_bytes(),
            ram_bytes = report.ram_bytes(),
            stripped_bytes = ?report.stripped_bytes,
            "Deployment binary footprint"
        );
        Ok(())
    }
}

fn read_text(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Reads `key: N` from the build script's stdout.
fn reported_bytes(build_output: &str, key: &str) -> Option<u64> {
    build_output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name.trim() == key).then(|| value.trim().parse().ok()).flatten()
    })
}

fn readme(report: &SizeReport, records: &[CommandRecord]) -> String {
    let mut out = String::from("# Minimal neural network binary\n\n");
    out.push_str("Size-optimized build of the generated model with a minimal driver.\n\n");
    let _ = writeln!(out, "- `{}`: unstripped build", files::MINIMAL_BINARY);
    let _ = writeln!(out, "- `{}`: stripped build for deployment\n", files::STRIPPED_BINARY);
    out.push_str("## Footprint\n\n");
    out.push_str(&report.to_markdown());
    if !records.is_empty() {
        out.push_str("\n## Commands\n\n");
        for record in records {
            let status = record.exit_code.map_or_else(|| "killed".to_string(), |c| c.to_string());
            let _ = writeln!(out, "- `{}` (exit {status})", record.command);
        }
    }
    out
}

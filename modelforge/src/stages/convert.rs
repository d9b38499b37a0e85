//! Conversion: turns the trained model into generated C source and carries
//! the test vectors forward.

use super::descriptor::{CommandKind, CommandSpec, FileSelector, InputFile, InputRole, OutputRole, StageDescriptor};
use super::train;
use crate::config::PipelineConfig;
use crate::core::{files, roles};

/// Stage name.
pub const STAGE: &str = "convert";

/// Builds the conversion descriptor.
///
/// The model is the first `*.onnx` file of the training output, renamed to
/// `model.onnx`; the converter's stdout becomes `time_series_model.c`.
#[must_use]
pub fn descriptor(config: &PipelineConfig) -> StageDescriptor {
    let fixtures = config.fixture_policy.requirement();

    StageDescriptor::new(STAGE)
        .with_input(InputRole::new(train::STAGE, roles::MODEL).with_file(InputFile::first_with_extension("onnx", files::MODEL_ONNX)))
        .with_input(
            InputRole::new(train::STAGE, roles::TEST_VECTORS)
                .with_file(InputFile::with_requirement(files::TEST_INPUT, fixtures))
                .with_file(InputFile::with_requirement(files::EXPECTED_OUTPUT, fixtures)),
        )
        .with_generated(files::GENERATED_SOURCE)
        .with_command(
            CommandSpec::new("convert", CommandKind::Convert, &config.toolchain.converter)
                .with_args([files::MODEL_ONNX])
                .capture_stdout(files::GENERATED_SOURCE),
        )
        .with_output(OutputRole::new(roles::GENERATED_SOURCE).with_required(files::GENERATED_SOURCE))
        .with_output(
            OutputRole::new(roles::TEST_VECTORS)
                .passthrough()
                .with_file(FileSelector::Exact(files::TEST_INPUT.to_string()), fixtures)
                .with_file(FileSelector::Exact(files::EXPECTED_OUTPUT.to_string()), fixtures),
        )
}

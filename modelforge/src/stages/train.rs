//! Training: runs the external training command and publishes the model
//! and the held-out test vectors.

use super::descriptor::{CommandKind, CommandSpec, FileRequirement, FileSelector, OutputRole, StageDescriptor, TemplateSpec};
use crate::config::PipelineConfig;
use crate::core::{files, roles};
use crate::templates::TemplateBundle;

/// Stage name.
pub const STAGE: &str = "train";

/// Builds the training descriptor.
#[must_use]
pub fn descriptor(config: &PipelineConfig) -> StageDescriptor {
    let train = &config.train;
    let fixtures = config.fixture_policy.requirement();

    let mut descriptor = StageDescriptor::new(STAGE)
        .with_command(CommandSpec::new("train", CommandKind::Train, &train.program).with_args(train.args.iter().cloned()))
        .with_output(
            OutputRole::new(roles::MODEL)
                .with_file(FileSelector::Extension("onnx".to_string()), FileRequirement::Required)
                .with_optional(files::METRICS)
                .with_optional(files::VISUALIZATION),
        )
        .with_output(
            OutputRole::new(roles::TEST_VECTORS)
                .with_file(FileSelector::Exact(files::TEST_INPUT.to_string()), fixtures)
                .with_file(FileSelector::Exact(files::EXPECTED_OUTPUT.to_string()), fixtures),
        );

    if let Some(dir) = &train.script_dir {
        descriptor = descriptor.with_bundle(TemplateBundle::Directory(dir.clone()));
        for script in &train.scripts {
            descriptor = descriptor.with_template(TemplateSpec::bundled(script));
        }
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FixturePolicy, TrainConfig};
    use std::path::PathBuf;

    #[test]
    fn test_default_descriptor() {
        let d = descriptor(&PipelineConfig::default());
        assert!(d.validate().is_ok());
        assert!(d.inputs.is_empty());
        assert!(d.templates.is_empty());
        assert_eq!(d.commands[0].program, "python");
        assert_eq!(d.produced_roles().collect::<Vec<_>>(), vec![roles::MODEL, roles::TEST_VECTORS]);
    }

    #[test]
    fn test_fixture_policy_applies_to_vectors() {
        let config = PipelineConfig::default().with_fixture_policy(FixturePolicy::Required);
        let d = descriptor(&config);
        let vectors = d.outputs.iter().find(|o| o.role == roles::TEST_VECTORS).unwrap();
        assert!(vectors.files.iter().all(|f| f.requirement == FileRequirement::Required));
    }

    #[test]
    fn test_script_dir_becomes_templates() {
        let config = PipelineConfig::default().with_train(TrainConfig {
            script_dir: Some(PathBuf::from("/opt/train")),
            scripts: vec!["run.py".into(), "model.py".into()],
            ..TrainConfig::default()
        });
        let d = descriptor(&config);
        assert_eq!(d.templates.len(), 2);
        assert_eq!(d.resolver().bundle(), &TemplateBundle::Directory(PathBuf::from("/opt/train")));
    }
}

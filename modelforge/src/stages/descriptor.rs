//! Declarative description of one stage.
//!
//! Everything that differs between stages is a field here; the executor
//! itself has a single code path.

use super::finalizer::StageFinalizer;
use crate::config::WorkAreaPolicy;
use crate::core::roles;
use crate::errors::{codes, ContractErrorInfo, PipelineValidationError};
use crate::process::Invocation;
use crate::templates::{TemplateBundle, TemplateResolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How the executor interprets a command's exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// The training procedure; non-zero exit fails the stage.
    Train,
    /// The model-to-source converter; non-zero exit or empty stdout fails the stage.
    Convert,
    /// A compiler or build script; non-zero exit fails the stage with diagnostics.
    Build,
    /// A built binary or inspection tool; exit status is recorded, never fatal.
    Execute,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Train => "train",
            Self::Convert => "convert",
            Self::Build => "build",
            Self::Execute => "execute",
        };
        f.write_str(label)
    }
}

/// Whether a file must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRequirement {
    /// Absence fails the stage.
    Required,
    /// Absence is logged and skipped.
    Optional,
}

/// Picks a file by name or by extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSelector {
    /// A file with exactly this name.
    Exact(String),
    /// The first file, by sorted name, with this extension.
    Extension(String),
}

impl FileSelector {
    /// Picks a name from a sorted listing.
    #[must_use]
    pub fn select<'a>(&self, names: &'a [String]) -> Option<&'a str> {
        match self {
            Self::Exact(name) => names.iter().find(|n| *n == name).map(String::as_str),
            Self::Extension(ext) => names
                .iter()
                .find(|n| Path::new(n).extension().is_some_and(|e| e == ext.as_str()))
                .map(String::as_str),
        }
    }

    /// Human-readable form used in errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exact(name) => name.clone(),
            Self::Extension(ext) => format!("*.{ext}"),
        }
    }
}

/// One file taken from an input artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Which file to take.
    pub selector: FileSelector,
    /// Name in the work area; the source name when unset.
    pub target: Option<String>,
    /// Whether the file must exist.
    pub requirement: FileRequirement,
}

impl InputFile {
    /// A required file copied under its own name.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            selector: FileSelector::Exact(name.into()),
            target: None,
            requirement: FileRequirement::Required,
        }
    }

    /// An optional file copied under its own name.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            selector: FileSelector::Exact(name.into()),
            target: None,
            requirement: FileRequirement::Optional,
        }
    }

    /// A file whose requirement is decided by the caller.
    #[must_use]
    pub fn with_requirement(name: impl Into<String>, requirement: FileRequirement) -> Self {
        Self {
            selector: FileSelector::Exact(name.into()),
            target: None,
            requirement,
        }
    }

    /// The first file with `extension`, copied as `target`.
    #[must_use]
    pub fn first_with_extension(extension: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            selector: FileSelector::Extension(extension.into()),
            target: Some(target.into()),
            requirement: FileRequirement::Required,
        }
    }

    /// The name the file gets inside the work area.
    #[must_use]
    pub fn target_name(&self, source: &str) -> String {
        self.target.clone().unwrap_or_else(|| source.to_string())
    }
}

/// An upstream artifact a stage consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRole {
    /// Producing stage.
    pub stage: String,
    /// Role tag.
    pub role: String,
    /// Files copied into the work area. Nothing else is copied.
    pub files: Vec<InputFile>,
}

impl InputRole {
    /// Creates an input role with no files.
    #[must_use]
    pub fn new(stage: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            role: role.into(),
            files: Vec::new(),
        }
    }

    /// Adds a file.
    #[must_use]
    pub fn with_file(mut self, file: InputFile) -> Self {
        self.files.push(file);
        self
    }

    /// `stage.role`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.stage, self.role)
    }
}

/// A template to materialize, with an optional fallback artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSpec {
    /// Template file name.
    pub name: String,
    /// `(stage, role)` of an input artifact searched when the bundle lacks the template.
    pub fallback: Option<(String, String)>,
}

impl TemplateSpec {
    /// A template resolved from the bundle only.
    #[must_use]
    pub fn bundled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fallback: None,
        }
    }

    /// Falls back to a same-named file in an input artifact.
    #[must_use]
    pub fn with_fallback(mut self, stage: impl Into<String>, role: impl Into<String>) -> Self {
        self.fallback = Some((stage.into(), role.into()));
        self
    }
}

/// One external command run in the work area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Short label used in logs and reports.
    pub label: String,
    /// Exit-status semantics.
    pub kind: CommandKind,
    /// Program; `./name` runs a file from the work area.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Work-area file receiving stdout.
    pub stdout_file: Option<String>,
    /// Work-area file receiving stderr.
    pub stderr_file: Option<String>,
    /// Budget override; the configured per-kind budget when unset.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Creates a command with no arguments and no captures.
    #[must_use]
    pub fn new(label: impl Into<String>, kind: CommandKind, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdout_file: None,
            stderr_file: None,
            timeout: None,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Writes stdout to a work-area file.
    #[must_use]
    pub fn capture_stdout(mut self, file: impl Into<String>) -> Self {
        self.stdout_file = Some(file.into());
        self
    }

    /// Writes stderr to a work-area file.
    #[must_use]
    pub fn capture_stderr(mut self, file: impl Into<String>) -> Self {
        self.stderr_file = Some(file.into());
        self
    }

    /// Overrides the budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The invocation for a given work area.
    #[must_use]
    pub fn invocation(&self, cwd: &Path) -> Invocation {
        let mut invocation = Invocation::new(&self.program, cwd).with_args(self.args.iter().cloned());
        invocation.env.clone_from(&self.env);
        invocation
    }
}

/// One file a stage publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Which work-area file to publish.
    pub selector: FileSelector,
    /// Whether it must exist once the commands finish.
    pub requirement: FileRequirement,
}

/// A role a stage publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRole {
    /// Role tag.
    pub role: String,
    /// Files in the role.
    pub files: Vec<OutputFile>,
    /// Republishes the same-named input role's content instead of producing it.
    pub passthrough: bool,
}

impl OutputRole {
    /// Creates an output role with no files.
    #[must_use]
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            files: Vec::new(),
            passthrough: false,
        }
    }

    /// Marks the role as carried forward from an input role of the same name.
    #[must_use]
    pub fn passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    /// Adds a required file.
    #[must_use]
    pub fn with_required(self, name: impl Into<String>) -> Self {
        self.with_file(FileSelector::Exact(name.into()), FileRequirement::Required)
    }

    /// Adds an optional file.
    #[must_use]
    pub fn with_optional(self, name: impl Into<String>) -> Self {
        self.with_file(FileSelector::Exact(name.into()), FileRequirement::Optional)
    }

    /// Adds a file with an explicit selector and requirement.
    #[must_use]
    pub fn with_file(mut self, selector: FileSelector, requirement: FileRequirement) -> Self {
        self.files.push(OutputFile { selector, requirement });
        self
    }
}

/// Everything the executor needs to run one stage.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Stage name; also the artifact namespace.
    pub name: String,
    /// Stages that must succeed first.
    pub dependencies: Vec<String>,
    /// Upstream artifacts consumed.
    pub inputs: Vec<InputRole>,
    /// Templates written into the work area.
    pub templates: Vec<TemplateSpec>,
    /// Model-specific file names a template must never overwrite.
    pub generated: BTreeSet<String>,
    /// Commands run in order.
    pub commands: Vec<CommandSpec>,
    /// Roles published on success.
    pub outputs: Vec<OutputRole>,
    /// Role receiving diagnostics on failure.
    pub diagnostics_role: String,
    /// Role receiving the stage report on success.
    pub report_role: String,
    /// Post-processing run after the commands, before publication.
    pub finalizers: Vec<Arc<dyn StageFinalizer>>,
    /// Work-area policy override.
    pub work_area_policy: Option<WorkAreaPolicy>,
    resolver: Arc<TemplateResolver>,
}

impl StageDescriptor {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            templates: Vec::new(),
            generated: BTreeSet::new(),
            commands: Vec::new(),
            outputs: Vec::new(),
            diagnostics_role: roles::DIAGNOSTICS.to_string(),
            report_role: roles::REPORT.to_string(),
            finalizers: Vec::new(),
            work_area_policy: None,
            resolver: Arc::new(TemplateResolver::new(TemplateBundle::Empty)),
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, stage: impl Into<String>) -> Self {
        self.dependencies.push(stage.into());
        self
    }

    /// Adds an input role; its stage becomes a dependency if it is not one already.
    #[must_use]
    pub fn with_input(mut self, input: InputRole) -> Self {
        if !self.dependencies.contains(&input.stage) {
            self.dependencies.push(input.stage.clone());
        }
        self.inputs.push(input);
        self
    }

    /// Sets the template bundle.
    #[must_use]
    pub fn with_bundle(mut self, bundle: TemplateBundle) -> Self {
        self.resolver = Arc::new(TemplateResolver::new(bundle));
        self
    }

    /// Adds a template.
    #[must_use]
    pub fn with_template(mut self, template: TemplateSpec) -> Self {
        self.templates.push(template);
        self
    }

    /// Marks a file name as model-specific.
    #[must_use]
    pub fn with_generated(mut self, name: impl Into<String>) -> Self {
        self.generated.insert(name.into());
        self
    }

    /// Adds a command.
    #[must_use]
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Adds an output role.
    #[must_use]
    pub fn with_output(mut self, output: OutputRole) -> Self {
        self.outputs.push(output);
        self
    }

    /// Adds a finalizer.
    #[must_use]
    pub fn with_finalizer(mut self, finalizer: Arc<dyn StageFinalizer>) -> Self {
        self.finalizers.push(finalizer);
        self
    }

    /// Overrides the work-area policy.
    #[must_use]
    pub fn with_work_area_policy(mut self, policy: WorkAreaPolicy) -> Self {
        self.work_area_policy = Some(policy);
        self
    }

    /// The resolver over this stage's bundle.
    #[must_use]
    pub fn resolver(&self) -> &TemplateResolver {
        &self.resolver
    }

    /// Names of the roles this stage produces itself.
    pub fn produced_roles(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().filter(|o| !o.passthrough).map(|o| o.role.as_str())
    }

    /// Returns true if the stage publishes `role`, produced or passed through.
    #[must_use]
    pub fn publishes(&self, role: &str) -> bool {
        self.outputs.iter().any(|o| o.role == role)
    }

    /// Finds the input role bound to `(stage, role)`.
    #[must_use]
    pub fn input(&self, stage: &str, role: &str) -> Option<&InputRole> {
        self.inputs.iter().find(|i| i.stage == stage && i.role == role)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a validation error with the `CONTRACT-001-DESCRIPTOR` code.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("Stage name must not be empty", "Give the stage a name."));
        }
        if self.commands.is_empty() {
            return Err(self.invalid(
                format!("Stage '{}' declares no commands", self.name),
                "Add at least one CommandSpec.",
            ));
        }

        let mut labels = HashSet::new();
        for command in &self.commands {
            if !labels.insert(command.label.as_str()) {
                return Err(self.invalid(
                    format!("Stage '{}' declares command '{}' twice", self.name, command.label),
                    "Give every command a distinct label.",
                ));
            }
            for file in command.stdout_file.iter().chain(command.stderr_file.iter()) {
                check_file_name(self, file)?;
            }
        }

        let mut templates = HashSet::new();
        for template in &self.templates {
            check_file_name(self, &template.name)?;
            if !templates.insert(template.name.as_str()) {
                return Err(self.invalid(
                    format!("Stage '{}' declares template '{}' twice", self.name, template.name),
                    "Remove the duplicate TemplateSpec.",
                ));
            }
            if let Some((stage, role)) = &template.fallback {
                if self.input(stage, role).is_none() {
                    return Err(self.invalid(
                        format!(
                            "Template '{}' falls back to '{stage}.{role}', which stage '{}' does not consume",
                            template.name, self.name
                        ),
                        "Declare the fallback artifact as an input role.",
                    ));
                }
            }
        }

        for input in &self.inputs {
            if input.stage == self.name {
                return Err(self.invalid(
                    format!("Stage '{}' consumes its own role '{}'", self.name, input.role),
                    "Inputs must come from upstream stages.",
                ));
            }
            for file in &input.files {
                if let Some(target) = &file.target {
                    check_file_name(self, target)?;
                }
            }
        }

        let mut outputs = HashSet::new();
        for output in &self.outputs {
            if output.role == self.diagnostics_role || output.role == self.report_role {
                return Err(self.invalid(
                    format!("Stage '{}' cannot publish reserved role '{}'", self.name, output.role),
                    "Diagnostics and report roles are published by the executor.",
                ));
            }
            if !outputs.insert(output.role.as_str()) {
                return Err(self.invalid(
                    format!("Stage '{}' declares output role '{}' twice", self.name, output.role),
                    "Merge the files into one OutputRole.",
                ));
            }
            if output.passthrough && !self.inputs.iter().any(|i| i.role == output.role) {
                return Err(self.invalid(
                    format!(
                        "Stage '{}' passes through role '{}' without consuming it",
                        self.name, output.role
                    ),
                    "Declare an input role with the same name.",
                ));
            }
        }
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>, hint: &str) -> PipelineValidationError {
        let message = message.into();
        PipelineValidationError::new(message.clone())
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::DESCRIPTOR, message)
                    .with_fix_hint(hint)
                    .with_context_entry("stage", self.name.clone()),
            )
    }
}

fn check_file_name(descriptor: &StageDescriptor, name: &str) -> Result<(), PipelineValidationError> {
    let plain = !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "." && name != "..";
    if plain {
        Ok(())
    } else {
        Err(descriptor.invalid(
            format!("'{name}' is not a plain file name"),
            "Work-area files live at the top level of the work area.",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::files;

    fn minimal() -> StageDescriptor {
        StageDescriptor::new("compile_test")
            .with_input(InputRole::new("convert", roles::GENERATED_SOURCE).with_file(InputFile::required(files::GENERATED_SOURCE)))
            .with_command(CommandSpec::new("compile", CommandKind::Build, "cc"))
    }

    #[test]
    fn test_selector_by_extension_takes_first_sorted() {
        let names = vec!["a.txt".to_string(), "b.onnx".to_string(), "c.onnx".to_string()];
        assert_eq!(FileSelector::Extension("onnx".into()).select(&names), Some("b.onnx"));
        assert_eq!(FileSelector::Exact("a.txt".into()).select(&names), Some("a.txt"));
        assert_eq!(FileSelector::Exact("z".into()).select(&names), None);
        assert_eq!(FileSelector::Extension("onnx".into()).describe(), "*.onnx");
    }

    #[test]
    fn test_input_adds_dependency_once() {
        let d = minimal().with_input(InputRole::new("convert", roles::TEST_VECTORS));
        assert_eq!(d.dependencies, vec!["convert".to_string()]);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_command_invocation_carries_env() {
        let spec = CommandSpec::new("build", CommandKind::Build, "sh")
            .with_args(["compile_minimal.sh"])
            .with_env("CC", "gcc");
        let inv = spec.invocation(Path::new("/w"));
        assert_eq!(inv.command_line(), "sh compile_minimal.sh");
        assert_eq!(inv.env.get("CC").map(String::as_str), Some("gcc"));
    }

    #[test]
    fn test_validation_requires_commands() {
        let err = StageDescriptor::new("x").validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::DESCRIPTOR));
    }

    #[test]
    fn test_validation_rejects_unconsumed_fallback() {
        let d = minimal().with_template(TemplateSpec::bundled(files::MODEL_IMPL).with_fallback("train", roles::MODEL));
        let err = d.validate().unwrap_err();
        assert!(err.message.contains("train.model"));
    }

    #[test]
    fn test_validation_rejects_reserved_and_duplicate_outputs() {
        let d = minimal().with_output(OutputRole::new(roles::DIAGNOSTICS));
        assert!(d.validate().is_err());

        let d = minimal()
            .with_output(OutputRole::new(roles::TEST_BINARY))
            .with_output(OutputRole::new(roles::TEST_BINARY));
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_passthrough_without_input() {
        let d = minimal().with_output(OutputRole::new(roles::TEST_VECTORS).passthrough());
        assert!(d.validate().is_err());

        let d = minimal()
            .with_input(InputRole::new("convert", roles::TEST_VECTORS))
            .with_output(OutputRole::new(roles::TEST_VECTORS).passthrough());
        assert!(d.validate().is_ok());
        assert_eq!(d.produced_roles().count(), 0);
        assert!(d.publishes(roles::TEST_VECTORS));
    }

    #[test]
    fn test_validation_rejects_path_like_capture() {
        let d = StageDescriptor::new("x")
            .with_command(CommandSpec::new("run", CommandKind::Execute, "./x").capture_stdout("../out.txt"));
        assert!(d.validate().is_err());
    }
}

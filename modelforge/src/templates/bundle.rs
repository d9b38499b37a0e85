//! Template bundles: the static files a stage ships with.

use crate::core::files;
use crate::errors::PipelineError;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

type EmbeddedFiles = &'static [(&'static str, &'static [u8])];

const COMPILE_TEST: EmbeddedFiles = &[
    (files::TEST_HARNESS, include_bytes!("../../bundled/compile_test/test_model.c") as &[u8]),
    (files::MODEL_IMPL, include_bytes!("../../bundled/compile_test/model_impl.c") as &[u8]),
    (files::MODEL_HEADER, include_bytes!("../../bundled/compile_test/time_series_model.h") as &[u8]),
];

const MINIMAL_BINARY: EmbeddedFiles = &[
    (files::MINIMAL_EXAMPLE, include_bytes!("../../bundled/minimal_binary/minimal_example.c") as &[u8]),
    (files::WRAPPER_HEADER, include_bytes!("../../bundled/minimal_binary/nn_wrapper.h") as &[u8]),
    (files::BUILD_SCRIPT, include_bytes!("../../bundled/minimal_binary/compile_minimal.sh") as &[u8]),
];

/// Where a stage's bundled templates come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateBundle {
    /// Templates compiled into the crate.
    Embedded {
        /// Bundle name, used in diagnostics.
        name: &'static str,
        /// `(file name, content)` pairs.
        files: EmbeddedFiles,
    },
    /// Templates read from a directory at resolution time.
    Directory(PathBuf),
    /// A stage without templates.
    Empty,
}

impl TemplateBundle {
    /// The harness, static implementation and header for the compile-and-test stage.
    #[must_use]
    pub fn compile_test() -> Self {
        Self::Embedded {
            name: "compile_test",
            files: COMPILE_TEST,
        }
    }

    /// The minimal example, wrapper header and build script for the minimal-binary stage.
    #[must_use]
    pub fn minimal_binary() -> Self {
        Self::Embedded {
            name: "minimal_binary",
            files: MINIMAL_BINARY,
        }
    }

    /// Where a template of this name is looked up; used to name paths in errors.
    #[must_use]
    pub fn location(&self, template: &str) -> PathBuf {
        match self {
            Self::Embedded { name, .. } => PathBuf::from(format!("<embedded:{name}>")).join(template),
            Self::Directory(dir) => dir.join(template),
            Self::Empty => PathBuf::from("<no bundle>").join(template),
        }
    }

    /// Loads a template's bytes, or `None` if the bundle does not have it.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a directory bundle holds the file but it cannot be read.
    pub fn load(&self, template: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        match self {
            Self::Embedded { files, .. } => Ok(files
                .iter()
                .find(|(name, _)| *name == template)
                .map(|(_, content)| content.to_vec())),
            Self::Directory(dir) => match fs::read(dir.join(template)) {
                Ok(content) => Ok(Some(content)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            Self::Empty => Ok(None),
        }
    }

    /// Names of the templates an embedded bundle ships; empty for other kinds.
    #[must_use]
    pub fn embedded_names(&self) -> Vec<&'static str> {
        match self {
            Self::Embedded { files, .. } => files.iter().map(|(name, _)| *name).collect(),
            _ => Vec::new(),
        }
    }
}

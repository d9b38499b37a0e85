//! Per-invocation scratch directories.

use crate::errors::PipelineError;
use crate::templates::Template;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Where a work-area file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    /// Copied from an input artifact; model-specific.
    Generated,
    /// Copied from an input artifact; not model-specific.
    Static,
    /// Written from a template.
    Template,
    /// Created by a command, a capture or a finalizer.
    Produced,
}

/// What happened when a template was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePlacement {
    /// No file of that name existed.
    Written,
    /// A static input of that name was overwritten.
    ReplacedStatic,
    /// A generated input of that name exists; the template was not written.
    SkippedGenerated,
}

/// An exclusive scratch directory for one stage invocation.
///
/// Tracks the origin of every file it holds so templates and generated
/// inputs never collide silently.
#[derive(Debug)]
pub struct WorkArea {
    dir: TempDir,
    origins: BTreeMap<String, FileOrigin>,
}

impl WorkArea {
    /// Creates a fresh, empty directory under `root`.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the directory cannot be created.
    pub fn create(root: &Path, stage: &str) -> Result<Self, PipelineError> {
        fs::create_dir_all(root).map_err(|e| PipelineError::write_error(root, &e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("modelforge-{stage}-"))
            .tempdir_in(root)
            .map_err(|e| PipelineError::write_error(root, &e))?;
        debug!(stage, path = %dir.path().display(), "Created work area");
        Ok(Self {
            dir,
            origins: BTreeMap::new(),
        })
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the work area.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Origin of a tracked file.
    #[must_use]
    pub fn origin(&self, name: &str) -> Option<FileOrigin> {
        self.origins.get(name).copied()
    }

    /// All tracked files and their origins.
    #[must_use]
    pub fn origins(&self) -> &BTreeMap<String, FileOrigin> {
        &self.origins
    }

    /// Copies an input file in, preserving permissions.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the copy fails.
    pub fn copy_in(&mut self, source: &Path, name: &str, origin: FileOrigin) -> Result<(), PipelineError> {
        let target = self.file(name);
        fs::copy(source, &target).map_err(|e| PipelineError::WriteError {
            path: target.clone(),
            reason: format!("cannot copy {}: {e}", source.display()),
        })?;
        self.origins.insert(name.to_string(), origin);
        Ok(())
    }

    /// Writes a template unless a generated file of the same name is present.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the write fails.
    pub fn place_template(&mut self, template: &Template) -> Result<TemplatePlacement, PipelineError> {
        let placement = match self.origin(&template.name) {
            Some(FileOrigin::Generated) => {
                warn!(
                    template = %template.name,
                    "Generated file shares a name with a template; keeping the generated file"
                );
                return Ok(TemplatePlacement::SkippedGenerated);
            }
            Some(FileOrigin::Static) => TemplatePlacement::ReplacedStatic,
            _ => TemplatePlacement::Written,
        };
        self.write(&template.name, &template.content, FileOrigin::Template)?;
        Ok(placement)
    }

    /// Writes a file and records its origin.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the write fails.
    pub fn write(&mut self, name: &str, content: &[u8], origin: FileOrigin) -> Result<PathBuf, PipelineError> {
        let target = self.file(name);
        fs::write(&target, content).map_err(|e| PipelineError::write_error(&target, &e))?;
        self.origins.insert(name.to_string(), origin);
        Ok(target)
    }

    /// Records every untracked top-level file as `Produced`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be listed.
    pub fn track_produced(&mut self) -> Result<(), PipelineError> {
        for name in self.list_files()? {
            self.origins.entry(name).or_insert(FileOrigin::Produced);
        }
        Ok(())
    }

    /// Sorted names of the regular files at the top level.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be listed.
    pub fn list_files(&self) -> Result<Vec<String>, PipelineError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes the directory, or keeps it and returns its path.
    #[must_use]
    pub fn finish(self, retain: bool) -> Option<PathBuf> {
        if retain {
            let path = self.dir.keep();
            debug!(path = %path.display(), "Retained work area");
            Some(path)
        } else {
            let path = self.dir.path().to_path_buf();
            if let Err(e) = self.dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove work area");
            }
            None
        }
    }
}

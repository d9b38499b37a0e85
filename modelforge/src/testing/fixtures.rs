//! Test fixtures for pipeline testing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::artifacts::{ArtifactStore, LocalArtifactStore, PublishFile};
use crate::config::PipelineConfig;
use crate::core::ArtifactRef;
use crate::errors::PipelineError;
use crate::process::ProcessRunner;
use crate::stages::StageExecutor;

/// A throwaway artifact store and work root under one temporary directory.
#[derive(Debug)]
pub struct ArtifactFixture {
    root: TempDir,
    store: Arc<LocalArtifactStore>,
}

impl ArtifactFixture {
    /// Creates the fixture.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the temporary directory cannot be created.
    pub fn new() -> Result<Self, PipelineError> {
        let root = TempDir::new()?;
        let store = Arc::new(LocalArtifactStore::new(root.path().join("artifacts"))?);
        Ok(Self { root, store })
    }

    /// The artifact store.
    #[must_use]
    pub fn store(&self) -> Arc<LocalArtifactStore> {
        Arc::clone(&self.store)
    }

    /// Root of every work area created through this fixture.
    #[must_use]
    pub fn work_root(&self) -> PathBuf {
        self.root.path().join("work")
    }

    /// A default config pointed at this fixture.
    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_artifact_root(self.store.root())
            .with_work_root(self.work_root())
    }

    /// An executor over this fixture's store, configured from `config`.
    #[must_use]
    pub fn executor(&self, config: &PipelineConfig, runner: Arc<dyn ProcessRunner>) -> StageExecutor {
        StageExecutor::from_config(config, self.store(), runner)
    }

    /// Publishes `stage.role` with the given files, as if the stage had run.
    ///
    /// # Errors
    ///
    /// Returns an error if a source file or the artifact cannot be written.
    pub fn seed<C: AsRef<[u8]>>(&self, stage: &str, role: &str, entries: &[(&str, C)]) -> Result<ArtifactRef, PipelineError> {
        let source = TempDir::new_in(self.root.path())?;
        let mut files = Vec::with_capacity(entries.len());
        for (name, content) in entries {
            let path = source.path().join(name);
            std::fs::write(&path, content.as_ref()).map_err(|e| PipelineError::write_error(&path, &e))?;
            files.push(PublishFile::new(*name, path));
        }
        self.store.publish(stage, role, &files)
    }

    /// Reads one file of a published artifact.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactNotFound` if the artifact or file is missing.
    pub fn read(&self, stage: &str, role: &str, file: &str) -> Result<Vec<u8>, PipelineError> {
        let artifact = self.store.materialize(stage, role)?;
        let path = artifact.file(file);
        std::fs::read(&path).map_err(|_| PipelineError::file_not_found(stage, role, file, &artifact.path))
    }

    /// Returns true if `stage.role` exists.
    #[must_use]
    pub fn has(&self, stage: &str, role: &str) -> bool {
        self.store.contains(stage, role)
    }

    /// Path of the fixture root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

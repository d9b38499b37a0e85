//! Filesystem-backed artifact store.

use crate::core::{files, ArtifactManifest, ArtifactRef};
use crate::errors::PipelineError;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A file to be committed as part of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFile {
    /// Name inside the artifact.
    pub name: String,
    /// Where the content currently lives.
    pub source: PathBuf,
}

impl PublishFile {
    /// Creates a publish entry.
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Storage for artifacts exchanged between stages.
///
/// A role is written only by the stage that owns it; readers may run
/// concurrently with other readers.
pub trait ArtifactStore: Send + Sync + Debug {
    /// Resolves an upstream artifact to a directory.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactNotFound` if the stage never published the role.
    fn materialize(&self, stage: &str, role: &str) -> Result<ArtifactRef, PipelineError>;

    /// Commits a set of files as the artifact `stage.role`.
    ///
    /// Republishing a role replaces the previous content entirely.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the destination cannot be written.
    fn publish(&self, stage: &str, role: &str, files: &[PublishFile]) -> Result<ArtifactRef, PipelineError>;

    /// Removes `stage.role` if it was published. Retracting an absent role
    /// is not an error.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the artifact exists but cannot be removed.
    fn retract(&self, stage: &str, role: &str) -> Result<(), PipelineError>;

    /// Lists the roles published by a stage, sorted.
    fn roles(&self, stage: &str) -> Vec<String>;

    /// Returns true if `stage.role` has been published.
    fn contains(&self, stage: &str, role: &str) -> bool {
        self.materialize(stage, role).is_ok()
    }
}

/// Artifact store rooted at a local directory: `<root>/<stage>/<role>/`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PipelineError::write_error(&root, &e))?;
        Ok(Self { root })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn role_dir(&self, stage: &str, role: &str) -> PathBuf {
        self.root.join(stage).join(role)
    }

    fn read_ref(&self, stage: &str, role: &str, dir: &Path) -> Result<ArtifactRef, PipelineError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != files::MANIFEST {
                names.push(name);
            }
        }
        names.sort();
        Ok(ArtifactRef {
            stage: stage.to_string(),
            role: role.to_string(),
            path: dir.to_path_buf(),
            files: names,
        })
    }

    /// Reads the manifest of a published artifact.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactNotFound` if the artifact or its manifest is missing.
    pub fn manifest(&self, stage: &str, role: &str) -> Result<ArtifactManifest, PipelineError> {
        let path = self.role_dir(stage, role).join(files::MANIFEST);
        let content = fs::read(&path)
            .map_err(|_| PipelineError::file_not_found(stage, role, files::MANIFEST, &path))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn materialize(&self, stage: &str, role: &str) -> Result<ArtifactRef, PipelineError> {
        let dir = self.role_dir(stage, role);
        if !dir.is_dir() {
            return Err(PipelineError::artifact_not_found(stage, role, &dir));
        }
        self.read_ref(stage, role, &dir)
    }

    fn publish(&self, stage: &str, role: &str, entries: &[PublishFile]) -> Result<ArtifactRef, PipelineError> {
        let stage_dir = self.root.join(stage);
        fs::create_dir_all(&stage_dir).map_err(|e| PipelineError::write_error(&stage_dir, &e))?;

        // Assemble next to the destination so the final rename stays on one filesystem.
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{role}-staging-"))
            .tempdir_in(&stage_dir)
            .map_err(|e| PipelineError::write_error(&stage_dir, &e))?;

        let mut manifest = ArtifactManifest::new(stage, role);
        for entry in entries {
            let content = fs::read(&entry.source).map_err(|e| PipelineError::WriteError {
                path: entry.source.clone(),
                reason: format!("cannot read source for '{}': {e}", entry.name),
            })?;
            let target = staging.path().join(&entry.name);
            fs::write(&target, &content).map_err(|e| PipelineError::write_error(&target, &e))?;
            copy_permissions(&entry.source, &target)?;
            manifest.add(&entry.name, &content);
        }
        let manifest_path = staging.path().join(files::MANIFEST);
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .map_err(|e| PipelineError::write_error(&manifest_path, &e))?;

        let dest = self.role_dir(stage, role);
        if dest.exists() {
            debug!(stage, role, "Replacing previously published artifact");
            fs::remove_dir_all(&dest).map_err(|e| PipelineError::write_error(&dest, &e))?;
        }
        fs::rename(staging.path(), &dest).map_err(|e| PipelineError::write_error(&dest, &e))?;
        // The staging directory no longer exists; dropping it is a no-op.
        drop(staging);

        info!(stage, role, files = entries.len(), path = %dest.display(), "Published artifact");
        self.read_ref(stage, role, &dest)
    }

    fn retract(&self, stage: &str, role: &str) -> Result<(), PipelineError> {
        let dir = self.role_dir(stage, role);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(stage, role, "Retracted artifact");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::write_error(&dir, &e)),
        }
    }

    fn roles(&self, stage: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.join(stage)) else {
            return Vec::new();
        };
        let mut roles: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        roles.sort();
        roles
    }
}

fn copy_permissions(source: &Path, target: &Path) -> Result<(), PipelineError> {
    let permissions = fs::metadata(source)
        .map_err(|e| PipelineError::write_error(source, &e))?
        .permissions();
    fs::set_permissions(target, permissions).map_err(|e| PipelineError::write_error(target, &e))
}

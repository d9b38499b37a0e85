//! Artifact references, manifests, and the stable role/file vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Artifact role tags used between stages.
pub mod roles {
    /// Serialized model (ONNX) plus training metrics.
    pub const MODEL: &str = "model";
    /// Held-out input and expected-output vectors.
    pub const TEST_VECTORS: &str = "test_vectors";
    /// Model-specific generated source.
    pub const GENERATED_SOURCE: &str = "generated_source";
    /// Compiled test binary.
    pub const TEST_BINARY: &str = "test_binary";
    /// Captured test output and the self-reported results file.
    pub const TEST_RESULTS: &str = "test_results";
    /// Stripped (and unstripped) deployment binary.
    pub const DEPLOYMENT_BINARY: &str = "deployment_binary";
    /// Build log and size metrics of the deployment binary.
    pub const BUILD_REPORT: &str = "build_report";
    /// Diagnostics persisted when a stage fails.
    pub const DIAGNOSTICS: &str = "diagnostics";
    /// The per-invocation stage report.
    pub const REPORT: &str = "report";
}

/// Stable file names shared by the stages.
pub mod files {
    /// Serialized model as copied into the converter's work area.
    pub const MODEL_ONNX: &str = "model.onnx";
    /// Generated model source.
    pub const GENERATED_SOURCE: &str = "time_series_model.c";
    /// Static implementation adapting the generated entry point.
    pub const MODEL_IMPL: &str = "model_impl.c";
    /// Static model header.
    pub const MODEL_HEADER: &str = "time_series_model.h";
    /// Test harness source.
    pub const TEST_HARNESS: &str = "test_model.c";
    /// Minimal usage example source.
    pub const MINIMAL_EXAMPLE: &str = "minimal_example.c";
    /// Wrapper header used by the minimal example.
    pub const WRAPPER_HEADER: &str = "nn_wrapper.h";
    /// Size-optimized build script.
    pub const BUILD_SCRIPT: &str = "compile_minimal.sh";
    /// Input vectors.
    pub const TEST_INPUT: &str = "test_input.csv";
    /// Expected output vectors.
    pub const EXPECTED_OUTPUT: &str = "expected_output.csv";
    /// Training metrics.
    pub const METRICS: &str = "metrics.txt";
    /// Training plot.
    pub const VISUALIZATION: &str = "model_visualization.png";
    /// Compiled test binary.
    pub const TEST_BINARY: &str = "test_model";
    /// Unstripped deployment binary.
    pub const MINIMAL_BINARY: &str = "minimal_nn";
    /// Stripped deployment binary.
    pub const STRIPPED_BINARY: &str = "minimal_nn_stripped";
    /// Captured stdout of the test binary.
    pub const TEST_OUTPUT: &str = "test_output.txt";
    /// Captured stderr of the test binary.
    pub const TEST_ERRORS: &str = "test_errors.txt";
    /// Results file the test binary writes on its own.
    pub const TEST_RESULTS: &str = "test_results.txt";
    /// Captured stdout of the minimal build.
    pub const BUILD_OUTPUT: &str = "build_output.txt";
    /// Captured stderr of the minimal build.
    pub const BUILD_ERRORS: &str = "build_errors.txt";
    /// Captured section listing of the stripped binary.
    pub const SIZE_OUTPUT: &str = "size_output.txt";
    /// Size metrics as JSON.
    pub const BUILD_REPORT: &str = "build_report.json";
    /// Deployment README.
    pub const README: &str = "README.md";
    /// Diagnostic stderr of a failed build.
    pub const COMPILATION_ERROR: &str = "compilation_error.txt";
    /// Stage report.
    pub const STAGE_REPORT: &str = "stage_report.json";
    /// Artifact manifest.
    pub const MANIFEST: &str = "manifest.json";
}

/// A published artifact: one role of one stage, resolved to a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// The producing stage.
    pub stage: String,
    /// The role tag.
    pub role: String,
    /// The directory holding the files.
    pub path: PathBuf,
    /// The file names in the artifact, sorted, excluding the manifest.
    pub files: Vec<String>,
}

impl ArtifactRef {
    /// Returns the path of one file inside the artifact.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Returns true if the artifact contains the named file.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
    }

    /// Returns a `stage.role` key for maps and logs.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.stage, self.role)
    }
}

/// One entry of an artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub bytes: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
}

/// Manifest written into every published artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// The producing stage.
    pub stage: String,
    /// The role tag.
    pub role: String,
    /// Entries sorted by name.
    pub files: Vec<ManifestEntry>,
    /// When the artifact was published.
    pub created_at: DateTime<Utc>,
}

impl ArtifactManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(stage: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            role: role.into(),
            files: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Adds an entry computed from file content.
    pub fn add(&mut self, name: impl Into<String>, content: &[u8]) {
        self.files.push(ManifestEntry {
            name: name.into(),
            bytes: content.len() as u64,
            sha256: sha256_hex(content),
        });
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Looks up an entry by file name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|e| e.name == name)
    }
}

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_ref_lookup() {
        let artifact = ArtifactRef {
            stage: "convert".to_string(),
            role: roles::GENERATED_SOURCE.to_string(),
            path: PathBuf::from("/store/convert/generated_source"),
            files: vec![files::GENERATED_SOURCE.to_string()],
        };

        assert!(artifact.contains(files::GENERATED_SOURCE));
        assert!(!artifact.contains(files::TEST_INPUT));
        assert_eq!(artifact.key(), "convert.generated_source");
        assert_eq!(
            artifact.file(files::GENERATED_SOURCE),
            PathBuf::from("/store/convert/generated_source/time_series_model.c")
        );
    }

    #[test]
    fn test_manifest_entries_sorted() {
        let mut manifest = ArtifactManifest::new("train", roles::TEST_VECTORS);
        manifest.add("test_input.csv", b"1\n2\n");
        manifest.add("expected_output.csv", b"3\n4\n");

        assert_eq!(manifest.files[0].name, "expected_output.csv");
        assert_eq!(manifest.entry("test_input.csv").unwrap().bytes, 4);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

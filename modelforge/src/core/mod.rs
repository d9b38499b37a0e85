//! Core domain model types for modelforge.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage and pipeline status enums
//! - Artifact references and manifests
//! - The stable role and file-name vocabulary shared by the stages

mod artifact;
mod status;

pub use artifact::{
    files, roles, sha256_hex, ArtifactManifest, ArtifactRef, ManifestEntry,
};
pub use status::{FailureCause, PipelineStatus, StageState};

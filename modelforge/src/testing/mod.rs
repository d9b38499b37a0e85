//! Testing utilities for modelforge pipelines.
//!
//! This module provides:
//! - A scripted process runner standing in for the toolchain
//! - Artifact fixtures for seeding upstream outputs
//! - Assertions over pipeline results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_not_attempted, assert_stage_failed_with, assert_stage_state, assert_stage_succeeded};
pub use fixtures::ArtifactFixture;
pub use mocks::{ScriptedResponse, ScriptedRunner};

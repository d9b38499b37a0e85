//! Pipeline building and execution.
//!
//! This module provides:
//! - A builder that validates dependencies, cycles and role bindings
//! - The DAG executor with sequential and sibling-concurrent modes
//! - Per-stage state tracking with upstream-failure propagation
//! - The standard four-stage pipeline

mod builder;
mod graph;
mod standard;
mod state;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use graph::{PipelineGraph, PipelineResult};
pub use standard::{run_pipeline, standard_pipeline};
pub use state::{StageRecord, StateTable};

//! # Modelforge
//!
//! An artifact-flow pipeline that takes a trained model to a tested,
//! size-optimized native binary:
//!
//! ```text
//! train -> convert -> compile_test
//!                  \-> build_minimal
//! ```
//!
//! - **Stage descriptors**: each stage declares its inputs, templates,
//!   external commands and published roles as data
//! - **Immutable artifacts**: stages exchange directories through an
//!   [`ArtifactStore`](artifacts::ArtifactStore), published atomically
//! - **Explicit failure**: a failed build stops its dependents, never its siblings
//! - **Events and tracing**: every stage transition is reported to an
//!   [`EventSink`](events::EventSink) and logged with `tracing`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use modelforge::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::load(None)?;
//! init_tracing(config.log_format)?;
//!
//! let result = run_pipeline(&config, Arc::new(TokioProcessRunner::new()), &LoggingEventSink::default()).await?;
//! println!("{}", result.to_dict());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod config;
pub mod core;
pub mod driver;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod stages;
pub mod templates;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactStore, LocalArtifactStore};
    pub use crate::config::{ExecutionMode, FixturePolicy, PipelineConfig, WorkAreaPolicy};
    pub use crate::core::{files, roles, ArtifactRef, FailureCause, PipelineStatus, StageState};
    pub use crate::driver::{DryRunSubmitter, JobHandle, JobSpec, JobSubmitter, LocalSubmitter};
    pub use crate::errors::{PipelineError, PipelineValidationError, StageError, StageFailure};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{run_pipeline, standard_pipeline, PipelineBuilder, PipelineGraph, PipelineResult};
    pub use crate::process::{ProcessRunner, TokioProcessRunner};
    pub use crate::stages::{StageDescriptor, StageExecutor};
}

//! Stage descriptors and the executor that runs them.
//!
//! A stage is data: inputs, templates, commands and outputs described by a
//! [`StageDescriptor`]. [`StageExecutor`] turns one descriptor into an
//! isolated work area, runs its commands and publishes what they produced.
//!
//! The four stages of the standard pipeline live in [`train`], [`convert`],
//! [`compile_test`] and [`minimal_binary`].

pub mod convert;
mod descriptor;
mod executor;
mod finalizer;
pub mod minimal_binary;
mod report;
mod size_report;
pub mod train;
mod work_area;

pub use descriptor::{
    CommandKind, CommandSpec, FileRequirement, FileSelector, InputFile, InputRole, OutputFile,
    OutputRole, StageDescriptor, TemplateSpec,
};
pub use executor::StageExecutor;
pub use finalizer::StageFinalizer;
pub use minimal_binary::SizeReportFinalizer;
pub use report::{CommandRecord, StageOutcome, StageReport, TemplateRecord};
pub use size_report::SizeReport;
pub use work_area::{FileOrigin, TemplatePlacement, WorkArea};

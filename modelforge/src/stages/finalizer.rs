//! Stage-specific post-processing hooks.

use super::report::CommandRecord;
use super::work_area::WorkArea;
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Runs after a stage's commands succeed and before its outputs are published.
///
/// Finalizers derive extra files (reports, READMEs) from what the commands
/// left in the work area.
#[async_trait]
pub trait StageFinalizer: Send + Sync + Debug {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Reads and writes work-area files.
    ///
    /// # Errors
    ///
    /// Any error fails the stage.
    async fn finalize(&self, work_area: &mut WorkArea, records: &[CommandRecord]) -> Result<(), PipelineError>;
}

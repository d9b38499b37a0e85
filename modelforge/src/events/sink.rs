//! Event sink trait and implementations.

use super::{EventKind, PipelineEvent};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use tracing::{debug, info, warn, Level};

/// Receives pipeline lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Delivers an event, awaiting the sink if it needs to.
    async fn emit(&self, event: &PipelineEvent);

    /// Delivers an event without blocking. Must never panic; sinks swallow
    /// their own delivery errors.
    fn try_emit(&self, event: &PipelineEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {}

    fn try_emit(&self, _event: &PipelineEvent) {}
}

/// Writes every event to `tracing`.
///
/// Failure events are always logged at `warn`; others at the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log(&self, event: &PipelineEvent) {
        let stage = event.stage.as_deref().unwrap_or("-");
        if event.kind == EventKind::StageFailed {
            warn!(event_type = %event.kind, run_id = %event.run_id, stage, data = %event.data, "Event: {}", event.kind);
        } else if self.level == Level::DEBUG {
            debug!(event_type = %event.kind, run_id = %event.run_id, stage, data = %event.data, "Event: {}", event.kind);
        } else {
            info!(event_type = %event.kind, run_id = %event.run_id, stage, data = %event.data, "Event: {}", event.kind);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.log(event);
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.log(event);
    }
}

/// Keeps every event in memory; used by tests and by callers that want a
/// full timeline after the run.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events.read().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    /// Returns the stages that emitted an event of `kind`, in order.
    #[must_use]
    pub fn stages_with(&self, kind: EventKind) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.stage.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

//! Pipeline lifecycle events.
//!
//! The graph executor emits one event per stage transition and one when the
//! run completes. Sinks are passed explicitly; there is no global sink.

mod event;
mod sink;

pub use event::{EventKind, PipelineEvent};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

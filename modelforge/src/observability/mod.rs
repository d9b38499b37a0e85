//! Observability utilities.

mod subscriber;
mod timer;

pub use subscriber::{env_filter, init_tracing, LogFormat};
pub use timer::SpanTimer;

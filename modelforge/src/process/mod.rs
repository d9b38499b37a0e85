//! External process execution.
//!
//! [`ProcessRunner`] is the only place the crate spawns processes. Each
//! invocation names its working directory explicitly and is bounded by a
//! caller-supplied timeout; a process that overruns is killed.

mod invocation;
mod runner;
mod timeout;

pub use invocation::{Invocation, ProcessOutput};
#[cfg(test)]
pub use runner::MockProcessRunner;
pub use runner::{ProcessRunner, TokioProcessRunner};
pub use timeout::{run_with_timeout, TimedResult};

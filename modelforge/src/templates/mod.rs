//! Static templates bundled with stages.
//!
//! A template is a named, read-only source, header or script file. Templates
//! are resolved from the stage's bundle first, then (when the stage declares
//! it) from a same-named file in an input artifact. A template that cannot be
//! found aborts the stage before any external process is spawned.

mod bundle;
mod resolver;

pub use bundle::TemplateBundle;
pub use resolver::{Template, TemplateResolver, TemplateSource};

//! Artifact storage.
//!
//! An artifact is an immutable directory of files produced by exactly one
//! stage under one role tag. Downstream stages only read artifacts; they copy
//! what they need into a private work area before touching anything.

mod store;

pub use store::{ArtifactStore, LocalArtifactStore, PublishFile};

//! Template resolution with optional co-located fallback.

use super::TemplateBundle;
use crate::core::sha256_hex;
use crate::errors::PipelineError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a resolved template's content came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum TemplateSource {
    /// The stage's own bundle.
    Bundle(PathBuf),
    /// A same-named file in an input artifact.
    Fallback(PathBuf),
}

/// A resolved template, ready to be written into a work area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// File name inside the work area.
    pub name: String,
    /// Raw content.
    pub content: Vec<u8>,
    /// Provenance.
    pub source: TemplateSource,
    /// Hex SHA-256 of the content.
    pub fingerprint: String,
}

impl Template {
    fn new(name: &str, content: Vec<u8>, source: TemplateSource) -> Self {
        let fingerprint = sha256_hex(&content);
        Self {
            name: name.to_string(),
            content,
            source,
            fingerprint,
        }
    }
}

/// Resolves template names against a bundle, caching embedded bundle hits.
///
/// Resolution is deterministic: the same name against an unchanged bundle
/// always yields byte-identical content.
#[derive(Debug)]
pub struct TemplateResolver {
    bundle: TemplateBundle,
    cache: DashMap<String, Template>,
}

impl TemplateResolver {
    /// Creates a resolver over a bundle.
    #[must_use]
    pub fn new(bundle: TemplateBundle) -> Self {
        Self {
            bundle,
            cache: DashMap::new(),
        }
    }

    /// Returns the bundle this resolver reads from.
    #[must_use]
    pub fn bundle(&self) -> &TemplateBundle {
        &self.bundle
    }

    /// Resolves a template from the bundle only.
    ///
    /// # Errors
    ///
    /// Returns `TemplateNotFound` naming the bundle path if the template is absent.
    pub fn resolve(&self, name: &str) -> Result<Template, PipelineError> {
        self.resolve_with_fallback(name, None)
    }

    /// Resolves a template: the bundle first, then `fallback_dir/name` if given.
    ///
    /// # Errors
    ///
    /// Returns `TemplateNotFound` naming every path tried.
    pub fn resolve_with_fallback(&self, name: &str, fallback_dir: Option<&Path>) -> Result<Template, PipelineError> {
        validate_name(name)?;

        if let Some(cached) = self.cache.get(name) {
            return Ok(cached.clone());
        }

        let bundle_path = self.bundle.location(name);
        if let Some(content) = self.bundle.load(name)? {
            let template = Template::new(name, content, TemplateSource::Bundle(bundle_path));
            debug!(template = name, fingerprint = %template.fingerprint, "Resolved template from bundle");
            // Directory bundles are re-read on every resolve so edits on disk are seen.
            if matches!(self.bundle, TemplateBundle::Embedded { .. }) {
                self.cache.insert(name.to_string(), template.clone());
            }
            return Ok(template);
        }

        let mut tried = vec![bundle_path];
        if let Some(dir) = fallback_dir {
            let candidate = dir.join(name);
            if candidate.is_file() {
                let content = fs::read(&candidate)?;
                debug!(template = name, path = %candidate.display(), "Resolved template from fallback");
                return Ok(Template::new(name, content, TemplateSource::Fallback(candidate)));
            }
            tried.push(candidate);
        }

        Err(PipelineError::TemplateNotFound {
            name: name.to_string(),
            tried,
        })
    }
}

fn validate_name(name: &str) -> Result<(), PipelineError> {
    let plain = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != "..";
    if plain {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "Template name '{name}' must be a plain file name"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::files;
    use tempfile::TempDir;

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = TemplateResolver::new(TemplateBundle::compile_test());
        let first = resolver.resolve(files::TEST_HARNESS).unwrap();
        let second = resolver.resolve(files::TEST_HARNESS).unwrap();

        assert_eq!(first.content, second.content);
        assert_eq!(first.fingerprint, second.fingerprint);

        let fresh = TemplateResolver::new(TemplateBundle::compile_test());
        assert_eq!(fresh.resolve(files::TEST_HARNESS).unwrap().content, first.content);
    }

    #[test]
    fn test_directory_bundle_sees_edits() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(files::TEST_HARNESS), "int main(void) { return 0; }\n").unwrap();
        let resolver = TemplateResolver::new(TemplateBundle::Directory(dir.path().to_path_buf()));
        let before = resolver.resolve(files::TEST_HARNESS).unwrap();

        fs::write(dir.path().join(files::TEST_HARNESS), "int main(void) { return 1; }\n").unwrap();
        let after = resolver.resolve(files::TEST_HARNESS).unwrap();

        assert_eq!(after.content, b"int main(void) { return 1; }\n");
        assert_ne!(after.fingerprint, before.fingerprint);
    }

    #[test]
    fn test_missing_template_names_expected_path() {
        let resolver = TemplateResolver::new(TemplateBundle::compile_test());
        let err = resolver.resolve("nn_wrapper.h").unwrap_err();

        match err {
            PipelineError::TemplateNotFound { name, tried } => {
                assert_eq!(name, "nn_wrapper.h");
                assert_eq!(tried, vec![PathBuf::from("<embedded:compile_test>/nn_wrapper.h")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bundle_wins_over_fallback() {
        let fallback = TempDir::new().unwrap();
        fs::write(fallback.path().join(files::MODEL_HEADER), "stale").unwrap();

        let resolver = TemplateResolver::new(TemplateBundle::compile_test());
        let template = resolver
            .resolve_with_fallback(files::MODEL_HEADER, Some(fallback.path()))
            .unwrap();

        assert!(matches!(template.source, TemplateSource::Bundle(_)));
        assert_ne!(template.content, b"stale");
    }

    #[test]
    fn test_fallback_used_when_bundle_lacks_template() {
        let fallback = TempDir::new().unwrap();
        fs::write(fallback.path().join(files::BUILD_SCRIPT), "#!/bin/sh\n").unwrap();

        let resolver = TemplateResolver::new(TemplateBundle::Empty);
        let template = resolver
            .resolve_with_fallback(files::BUILD_SCRIPT, Some(fallback.path()))
            .unwrap();

        assert_eq!(template.content, b"#!/bin/sh\n");
        assert_eq!(
            template.source,
            TemplateSource::Fallback(fallback.path().join(files::BUILD_SCRIPT))
        );
    }

    #[test]
    fn test_missing_everywhere_lists_both_paths() {
        let fallback = TempDir::new().unwrap();
        let resolver = TemplateResolver::new(TemplateBundle::Empty);
        let err = resolver
            .resolve_with_fallback("model_impl.c", Some(fallback.path()))
            .unwrap_err();

        match err {
            PipelineError::TemplateNotFound { tried, .. } => {
                assert_eq!(tried.len(), 2);
                assert_eq!(tried[1], fallback.path().join("model_impl.c"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejects_path_like_names() {
        let resolver = TemplateResolver::new(TemplateBundle::compile_test());
        assert!(matches!(resolver.resolve("../etc/passwd"), Err(PipelineError::Config(_))));
        assert!(matches!(resolver.resolve(""), Err(PipelineError::Config(_))));
    }
}

//! Directory translation applied to reported paths before classification.
//!
//! A translation rewrites a directory prefix (for example a substituted
//! drive or a bind mount) into the location the manifest was built against.

use std::path::{Path, PathBuf};

use crate::error::{SandboxError, SandboxResult};
use crate::paths::normalize;

/// Ordered `(from, to)` directory rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryTranslator {
    rules: Vec<(PathBuf, PathBuf)>,
}

impl DirectoryTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rewrite of `from` to `to`. Both must be absolute.
    pub fn add(&mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> SandboxResult<()> {
        let from = from.into();
        let to = to.into();
        for path in [&from, &to] {
            if !path.is_absolute() {
                return Err(SandboxError::RelativePath { path: path.clone() });
            }
        }
        self.rules.push((normalize(&from), normalize(&to)));
        Ok(())
    }

    pub fn rules(&self) -> &[(PathBuf, PathBuf)] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite `path` until no rule applies.
    ///
    /// Validated translators always terminate; an unvalidated cyclic set stops
    /// after one pass per rule and returns the last rewrite.
    pub fn translate(&self, path: &Path) -> PathBuf {
        match self.translate_bounded(path) {
            Ok(path) | Err(path) => path,
        }
    }

    /// Reject rule sets where some prefix never stops rewriting.
    pub fn validate(&self) -> SandboxResult<()> {
        for (from, _) in &self.rules {
            if self.translate_bounded(from).is_err() {
                return Err(SandboxError::TranslationCycle { path: from.clone() });
            }
        }
        Ok(())
    }

    fn translate_bounded(&self, path: &Path) -> Result<PathBuf, PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..=self.rules.len() {
            match self.apply_once(&current) {
                Some(next) if next != current => current = next,
                _ => return Ok(current),
            }
        }
        Err(current)
    }

    /// Apply the rule with the longest matching `from` prefix.
    fn apply_once(&self, path: &Path) -> Option<PathBuf> {
        self.rules
            .iter()
            .filter(|(from, _)| path.starts_with(from))
            .max_by_key(|(from, _)| from.components().count())
            .map(|(from, to)| match path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.clone(),
                Ok(rest) => to.join(rest),
                Err(_) => path.to_path_buf(),
            })
    }
}

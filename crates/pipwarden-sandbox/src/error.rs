//! Error types for sandbox operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building manifests or preparing a sandboxed run.
///
/// Classification outcomes (denied accesses, allowlist misses, unresolved
/// symlinks) are values, not errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The manifest was already serialized and can no longer change.
    #[error("Manifest is sealed; cannot modify after encoding")]
    ManifestSealed,

    /// A manifest path was not absolute.
    #[error("Manifest paths must be absolute: {path}")]
    RelativePath { path: PathBuf },

    /// Binary manifest could not be decoded.
    #[error("Invalid manifest encoding at byte {offset}: {reason}")]
    ManifestDecode { offset: usize, reason: String },

    /// Directory translations loop back on themselves.
    #[error("Directory translation cycle involving {path}")]
    TranslationCycle { path: PathBuf },

    /// An allowlist entry could not be compiled.
    #[error("Invalid allowlist entry '{name}': {reason}")]
    InvalidAllowlistEntry { name: String, reason: String },

    /// A path lies outside the root jail.
    #[error("Path {path} is outside jail root {root}")]
    OutsideJail { path: PathBuf, root: PathBuf },

    /// Journal could not be created.
    #[error("Failed to open journal {path}: {source}")]
    JournalOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

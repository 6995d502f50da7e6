//! Error types for external execution.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while preparing or running an external invocation.
///
/// Failures of the launched processes themselves are not errors; they are
/// classified into an [`ExternalExecutionResult`](crate::ExternalExecutionResult).
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A request, info or result file could not be read or written.
    #[error("Failed to access {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document did not have the expected shape.
    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The invocation cannot be run as described.
    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error(transparent)]
    Sandbox(#[from] pipwarden_sandbox::SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for execution operations.
pub type ExecResult<T> = std::result::Result<T, ExecError>;

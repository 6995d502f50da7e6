//! Serialized invocation info and sandboxed-process result.
//!
//! These are the two documents exchanged with the external helper: the engine
//! writes a [`SandboxedInvocationInfo`], the helper writes back a
//! [`SandboxedProcessResult`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipwarden_config::{RootJailConfig, SandboxKind};
use pipwarden_types::{PipId, ReportedFileAccess, ReportedProcess};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};

/// Everything the helper needs to run one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxedInvocationInfo {
    pub pip_id: PipId,
    pub tool_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub sandbox_kind: SandboxKind,
    #[serde(default)]
    pub jail: Option<RootJailConfig>,
    /// Write captured stdout here instead of into the result.
    #[serde(default)]
    pub stdout_path: Option<PathBuf>,
    #[serde(default)]
    pub stderr_path: Option<PathBuf>,
}

impl SandboxedInvocationInfo {
    pub fn new(
        pip_id: PipId,
        tool_path: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pip_id,
            tool_path: tool_path.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            timeout_secs: None,
            sandbox_kind: SandboxKind::default(),
            jail: None,
            stdout_path: None,
            stderr_path: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_jail(mut self, jail: RootJailConfig) -> Self {
        self.jail = Some(jail);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Tool command line as one string, used for breakaway matching and logs.
    pub fn command_line(&self) -> String {
        let mut line = self.tool_path.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// What the helper observed running the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxedProcessResult {
    pub pip_id: PipId,
    pub exit_code: i32,
    #[serde(default)]
    pub killed: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub sandbox_kind: SandboxKind,
    #[serde(default)]
    pub accesses: Vec<ReportedFileAccess>,
    #[serde(default)]
    pub processes: Vec<ReportedProcess>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SandboxedProcessResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.killed && !self.timed_out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON files
// ─────────────────────────────────────────────────────────────────────────────

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> ExecResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| ExecError::File {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ExecError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a JSON document, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> ExecResult<()> {
    let file_error = |source| ExecError::File {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(file_error)?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|source| ExecError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, content).map_err(file_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_defaults_from_minimal_json() {
        let json = r#"{"pip_id": 5, "tool_path": "/bin/true", "working_dir": "/tmp"}"#;
        let info: SandboxedInvocationInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.pip_id, PipId::new(5));
        assert!(info.args.is_empty());
        assert_eq!(info.sandbox_kind, SandboxKind::Native);
        assert!(info.timeout().is_none());
        assert!(info.jail.is_none());
    }

    #[test]
    fn test_command_line() {
        let info = SandboxedInvocationInfo::new(PipId::new(1), "/usr/bin/cc", "/w")
            .with_args(["-c", "a.c"]);
        assert_eq!(info.command_line(), "/usr/bin/cc -c a.c");
    }

    #[test]
    fn test_json_file_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/result.json");

        let missing = read_json::<SandboxedProcessResult>(&path).unwrap_err();
        assert!(matches!(missing, ExecError::File { .. }));

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        let malformed = read_json::<SandboxedProcessResult>(&path).unwrap_err();
        assert!(matches!(malformed, ExecError::Json { .. }));
        assert!(malformed.to_string().contains("result.json"));
    }

    #[test]
    fn test_write_json_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/info.json");
        let info = SandboxedInvocationInfo::new(PipId::new(2), "/bin/sh", "/").with_env("K", "V");
        write_json(&path, &info).unwrap();
        let back: SandboxedInvocationInfo = read_json(&path).unwrap();
        assert_eq!(back.env.get("K").map(String::as_str), Some("V"));
    }
}

//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [sandbox]                # manifest flags and report-channel tuning
//! [[allowlist]]            # tolerated accesses, one table per entry
//! [jail]                   # optional root jail
//! [external]               # out-of-process helper
//! [vm]                     # VM command proxy
//! [logging]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipwardenConfig {
    /// Sandbox policy and report-channel settings.
    pub sandbox: Option<SandboxConfig>,

    /// Allowlist entries, evaluated independently.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<AllowlistEntryConfig>,

    /// Root jail for the sandboxed tool.
    pub jail: Option<RootJailConfig>,

    /// Out-of-process helper settings.
    pub external: Option<ExternalConfig>,

    /// VM command proxy settings.
    pub vm: Option<VmConfig>,

    /// Logging settings.
    pub logging: Option<LoggingConfig>,
}

impl PipwardenConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections replace whole; allowlist entries with the same name replace
    /// the earlier entry, new names are appended.
    pub fn merge(&mut self, other: PipwardenConfig) {
        if other.sandbox.is_some() {
            self.sandbox = other.sandbox;
        }

        for entry in other.allowlist {
            match self.allowlist.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => *existing = entry,
                None => self.allowlist.push(entry),
            }
        }

        if other.jail.is_some() {
            self.jail = other.jail;
        }

        if other.external.is_some() {
            self.external = other.external;
        }

        if other.vm.is_some() {
            self.vm = other.vm;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Sandbox section, or defaults when absent.
    pub fn sandbox_or_default(&self) -> SandboxConfig {
        self.sandbox.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Which interception backend runs the tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// Platform default native backend.
    #[default]
    Native,
    /// ptrace-based tracer (Linux).
    Ptrace,
    /// No interception.
    None,
}

/// Policy for paths outside every declared root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    /// Deny and report the access.
    #[default]
    DenyWithReport,
    /// Deny silently.
    Deny,
    /// Allow reads and probes, deny writes.
    AllowRead,
}

/// Sandbox section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    /// Fail the pip when an undeclared access is observed.
    pub fail_unexpected_accesses: bool,
    /// Report every access, not only unexpected ones.
    pub report_file_accesses: bool,
    pub report_unexpected_accesses: bool,
    pub monitor_child_processes: bool,
    /// Rewrite paths through intermediate directory symlinks.
    pub resolve_symlinks: bool,
    pub report_process_args: bool,
    pub default_policy: DefaultPolicy,
    /// Time without any report after which the channel is considered stalled.
    pub drought_timeout_secs: u64,
    /// Number of report queues the backend drains.
    pub report_queue_count: usize,
    /// Below this much available RAM the backend throttles report draining.
    pub low_memory_threshold_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Native,
            fail_unexpected_accesses: true,
            report_file_accesses: false,
            report_unexpected_accesses: true,
            monitor_child_processes: true,
            resolve_symlinks: true,
            report_process_args: false,
            default_policy: DefaultPolicy::DenyWithReport,
            drought_timeout_secs: 30,
            report_queue_count: 4,
            low_memory_threshold_mb: 512,
        }
    }
}

impl SandboxConfig {
    pub fn drought_timeout(&self) -> Duration {
        Duration::from_secs(self.drought_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Allowlist
// ─────────────────────────────────────────────────────────────────────────────

/// One allowlist entry.
///
/// Exactly one of `tool_path` (absolute executable path) or `tool_name`
/// (executable name pattern) must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistEntryConfig {
    pub name: String,
    pub tool_path: Option<PathBuf>,
    pub tool_name: Option<String>,
    /// Regex matched against the accessed path; empty or absent matches any.
    pub path_regex: Option<String>,
    /// Whether a match still allows the result to be cached.
    pub allow_caching: bool,
}

impl AllowlistEntryConfig {
    /// Check the entry names exactly one tool identity.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| ConfigError::InvalidAllowlistEntry {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        match (&self.tool_path, &self.tool_name) {
            (Some(_), Some(_)) => Err(invalid("set either tool_path or tool_name, not both")),
            (None, None) => Err(invalid("one of tool_path or tool_name is required")),
            (Some(path), None) if !path.is_absolute() => Err(invalid("tool_path must be absolute")),
            (None, Some(name)) if name.is_empty() => Err(invalid("tool_name must not be empty")),
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Root jail
// ─────────────────────────────────────────────────────────────────────────────

/// Root jail section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootJailConfig {
    /// Jail root directory.
    pub root: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Program used to enter the jail; defaults to `sudo`.
    pub program: Option<String>,
    /// Arguments placed before the jail root; default `["chroot"]`.
    pub args: Option<Vec<String>>,
    pub disable_sandboxing: bool,
    pub disable_auditing: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// External execution
// ─────────────────────────────────────────────────────────────────────────────

/// Out-of-process helper section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    /// Helper executable that runs the sandboxed tool.
    pub helper_path: PathBuf,
    /// Directory for invocation-info and result files.
    pub work_dir: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            helper_path: PathBuf::from("pipwarden"),
            work_dir: None,
            timeout_secs: 600,
        }
    }
}

impl ExternalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// VM command proxy section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// VM command proxy executable on the host.
    pub proxy_path: PathBuf,
    /// Shared directory for request/response files, visible to the VM.
    pub io_dir: PathBuf,
    /// Low-privilege host user the VM runs builds as.
    pub user: String,
    /// Environment variable holding that user's password.
    pub password_env: Option<String>,
    /// Helper executable path as seen from inside the VM.
    pub helper_path_in_vm: PathBuf,
    pub timeout_secs: u64,
    pub init_timeout_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            proxy_path: PathBuf::from("vm-command-proxy"),
            io_dir: PathBuf::from("vm-io"),
            user: String::new(),
            password_env: None,
            helper_path_in_vm: PathBuf::from("pipwarden"),
            timeout_secs: 600,
            init_timeout_secs: 120,
        }
    }
}

impl VmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Read the low-privilege password from the configured variable.
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter level (`info`, `debug`, ...).
    pub level: String,
    /// Whether JSON file logging is enabled.
    pub file: bool,
    /// Directory for log files; defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
            dir: None,
        }
    }
}

//! Allowlist of tolerated file accesses.
//!
//! An entry names a tool (by absolute executable path, or by a pattern over
//! the executable's file name) and optionally a path regex. Matching is pure:
//! the same `(access, tool)` pair always yields the same answer, which lets
//! cached access sets be replayed through the same rules.

use std::path::{Path, PathBuf};

use pipwarden_config::AllowlistEntryConfig;
use pipwarden_types::ReportedFileAccess;
use regex::Regex;

use crate::error::{SandboxError, SandboxResult};

/// How a tool is identified.
#[derive(Debug, Clone)]
pub enum ToolIdentity {
    /// Exact executable path.
    AbsolutePath(PathBuf),
    /// Pattern over the executable's file name (`cl`, `mspdbsrv*`).
    Name(glob::Pattern),
}

impl ToolIdentity {
    pub fn matches(&self, tool: &Path) -> bool {
        match self {
            ToolIdentity::AbsolutePath(path) => path == tool,
            ToolIdentity::Name(pattern) => tool
                .file_name()
                .map(|name| pattern.matches(&name.to_string_lossy()))
                .unwrap_or(false),
        }
    }
}

/// Outcome of matching an access against the allowlist.
///
/// Ordered from weakest to strongest so the most permissive match is the max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllowlistMatch {
    NoMatch,
    MatchesButNotCaching,
    MatchesAndAllowsCaching,
}

impl AllowlistMatch {
    pub fn is_match(self) -> bool {
        self != AllowlistMatch::NoMatch
    }
}

/// One allowlist rule.
#[derive(Debug, Clone)]
pub struct AllowlistEntry {
    pub name: String,
    pub identity: ToolIdentity,
    pub path_regex: Option<Regex>,
    pub allows_caching: bool,
}

impl AllowlistEntry {
    pub fn new(name: impl Into<String>, identity: ToolIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
            path_regex: None,
            allows_caching: false,
        }
    }

    pub fn with_path_regex(mut self, regex: Regex) -> Self {
        self.path_regex = Some(regex);
        self
    }

    pub fn with_caching(mut self, allows_caching: bool) -> Self {
        self.allows_caching = allows_caching;
        self
    }

    /// Compile a config entry.
    pub fn from_config(config: &AllowlistEntryConfig) -> SandboxResult<Self> {
        let invalid = |reason: String| SandboxError::InvalidAllowlistEntry {
            name: config.name.clone(),
            reason,
        };

        let identity = match (&config.tool_path, &config.tool_name) {
            (Some(path), None) if path.is_absolute() => ToolIdentity::AbsolutePath(path.clone()),
            (None, Some(name)) => ToolIdentity::Name(
                glob::Pattern::new(name).map_err(|e| invalid(format!("bad tool_name: {e}")))?,
            ),
            _ => {
                return Err(invalid(
                    "exactly one of an absolute tool_path or tool_name is required".to_string(),
                ));
            }
        };

        let path_regex = match config.path_regex.as_deref() {
            None | Some("") => None,
            Some(pattern) => {
                Some(Regex::new(pattern).map_err(|e| invalid(format!("bad path_regex: {e}")))?)
            }
        };

        Ok(Self {
            name: config.name.clone(),
            identity,
            path_regex,
            allows_caching: config.allow_caching,
        })
    }

    /// Both the tool identity and, if present, the path regex must match.
    pub fn matches(&self, access: &ReportedFileAccess, tool: &Path) -> AllowlistMatch {
        if !self.identity.matches(tool) {
            return AllowlistMatch::NoMatch;
        }
        if let Some(regex) = &self.path_regex
            && !regex.is_match(&access.effective_path().to_string_lossy())
        {
            return AllowlistMatch::NoMatch;
        }
        if self.allows_caching {
            AllowlistMatch::MatchesAndAllowsCaching
        } else {
            AllowlistMatch::MatchesButNotCaching
        }
    }
}

/// A set of allowlist entries evaluated independently.
#[derive(Debug, Clone, Default)]
pub struct FileAccessAllowlist {
    entries: Vec<AllowlistEntry>,
}

impl FileAccessAllowlist {
    pub fn new(entries: Vec<AllowlistEntry>) -> Self {
        Self { entries }
    }

    /// Compile config entries, failing on the first invalid one.
    pub fn from_config(entries: &[AllowlistEntryConfig]) -> SandboxResult<Self> {
        entries
            .iter()
            .map(AllowlistEntry::from_config)
            .collect::<SandboxResult<Vec<_>>>()
            .map(Self::new)
    }

    pub fn add(&mut self, entry: AllowlistEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AllowlistEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most permissive match over all entries.
    pub fn matches(&self, access: &ReportedFileAccess, tool: &Path) -> AllowlistMatch {
        let mut best = AllowlistMatch::NoMatch;
        for entry in &self.entries {
            let result = entry.matches(access, tool);
            if result > best {
                tracing::trace!(entry = %entry.name, ?result, path = %access.path.display(), "Allowlist match");
                best = result;
                if best == AllowlistMatch::MatchesAndAllowsCaching {
                    break;
                }
            }
        }
        best
    }
}

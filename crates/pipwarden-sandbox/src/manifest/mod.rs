//! Per-invocation file-access manifest.
//!
//! The manifest is built from a pip's declared inputs and outputs, encoded
//! once for the interception backend, and then only queried. Encoding seals
//! it; a sealed manifest is immutable and can be shared across reporting
//! threads behind an `Arc`.

mod codec;
mod tree;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use pipwarden_config::{DefaultPolicy, SandboxConfig};
use pipwarden_types::{FileAccessPolicy, ManifestFlags, PipId};

use crate::allowlist::FileAccessAllowlist;
use crate::error::{SandboxError, SandboxResult};
use crate::paths::normalize;
use crate::translator::DirectoryTranslator;

pub use codec::{MAGIC, VERSION};
pub use tree::PolicyLookup;
use tree::PolicyNode;

/// A child process allowed to escape interception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakawayChildProcess {
    /// Executable file name.
    pub tool_name: String,
    /// Substring the command line must contain, if any.
    pub required_args: Option<String>,
}

impl BreakawayChildProcess {
    pub fn matches(&self, tool: &Path, args: &str) -> bool {
        let name_matches = tool
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == self.tool_name);
        name_matches
            && self
                .required_args
                .as_deref()
                .is_none_or(|required| args.contains(required))
    }
}

/// Policy manifest for one tool invocation.
#[derive(Debug, Clone)]
pub struct FileAccessManifest {
    pip_id: PipId,
    flags: ManifestFlags,
    default_policy: FileAccessPolicy,
    root: PolicyNode,
    translator: DirectoryTranslator,
    breakaway: Vec<BreakawayChildProcess>,
    allowlist: Arc<FileAccessAllowlist>,
    encoded: Option<Bytes>,
}

impl FileAccessManifest {
    /// Empty manifest with deny-with-report default and the usual report flags.
    pub fn new(pip_id: PipId) -> Self {
        Self {
            pip_id,
            flags: ManifestFlags::FAIL_UNEXPECTED_ACCESSES
                | ManifestFlags::REPORT_UNEXPECTED_ACCESSES
                | ManifestFlags::MONITOR_CHILD_PROCESSES
                | ManifestFlags::RESOLVE_SYMLINKS,
            default_policy: FileAccessPolicy::DENY_WITH_REPORT,
            root: PolicyNode::default(),
            translator: DirectoryTranslator::new(),
            breakaway: Vec::new(),
            allowlist: Arc::new(FileAccessAllowlist::default()),
            encoded: None,
        }
    }

    /// Manifest with flags and default policy taken from the `[sandbox]` section.
    pub fn from_config(pip_id: PipId, config: &SandboxConfig) -> Self {
        let mut flags = ManifestFlags::NONE;
        for (enabled, flag) in [
            (config.fail_unexpected_accesses, ManifestFlags::FAIL_UNEXPECTED_ACCESSES),
            (config.report_file_accesses, ManifestFlags::REPORT_FILE_ACCESSES),
            (config.report_unexpected_accesses, ManifestFlags::REPORT_UNEXPECTED_ACCESSES),
            (config.monitor_child_processes, ManifestFlags::MONITOR_CHILD_PROCESSES),
            (config.resolve_symlinks, ManifestFlags::RESOLVE_SYMLINKS),
            (config.report_process_args, ManifestFlags::REPORT_PROCESS_ARGS),
        ] {
            if enabled {
                flags |= flag;
            }
        }

        let default_policy = match config.default_policy {
            DefaultPolicy::DenyWithReport => FileAccessPolicy::DENY_WITH_REPORT,
            DefaultPolicy::Deny => FileAccessPolicy::DENY,
            DefaultPolicy::AllowRead => FileAccessPolicy::ALLOW_READ_ONLY,
        };

        Self {
            flags,
            default_policy,
            ..Self::new(pip_id)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Building
    // ─────────────────────────────────────────────────────────────────────────

    fn ensure_mutable(&self) -> SandboxResult<()> {
        if self.encoded.is_some() {
            return Err(SandboxError::ManifestSealed);
        }
        Ok(())
    }

    fn checked(path: &Path) -> SandboxResult<std::path::PathBuf> {
        if !path.is_absolute() {
            return Err(SandboxError::RelativePath {
                path: path.to_path_buf(),
            });
        }
        Ok(normalize(path))
    }

    /// Set the policy for `path` and everything below it.
    pub fn add_scope(
        &mut self,
        path: impl AsRef<Path>,
        policy: FileAccessPolicy,
    ) -> SandboxResult<()> {
        self.ensure_mutable()?;
        let path = Self::checked(path.as_ref())?;
        self.root.node_mut(&path).cone_policy = Some(policy);
        Ok(())
    }

    /// Set the policy for exactly `path`.
    pub fn add_path(
        &mut self,
        path: impl AsRef<Path>,
        policy: FileAccessPolicy,
    ) -> SandboxResult<()> {
        self.ensure_mutable()?;
        let path = Self::checked(path.as_ref())?;
        self.root.node_mut(&path).node_policy = Some(policy);
        Ok(())
    }

    pub fn add_translation(
        &mut self,
        from: impl AsRef<Path>,
        to: impl AsRef<Path>,
    ) -> SandboxResult<()> {
        self.ensure_mutable()?;
        self.translator
            .add(from.as_ref().to_path_buf(), to.as_ref().to_path_buf())
    }

    pub fn add_breakaway(
        &mut self,
        tool_name: impl Into<String>,
        required_args: Option<&str>,
    ) -> SandboxResult<()> {
        self.ensure_mutable()?;
        self.breakaway.push(BreakawayChildProcess {
            tool_name: tool_name.into(),
            required_args: required_args.map(str::to_string),
        });
        Ok(())
    }

    pub fn set_flags(&mut self, flags: ManifestFlags) -> SandboxResult<()> {
        self.ensure_mutable()?;
        self.flags = flags;
        Ok(())
    }

    pub fn set_default_policy(&mut self, policy: FileAccessPolicy) -> SandboxResult<()> {
        self.ensure_mutable()?;
        self.default_policy = policy;
        Ok(())
    }

    pub fn set_allowlist(&mut self, allowlist: FileAccessAllowlist) -> SandboxResult<()> {
        self.ensure_mutable()?;
        self.allowlist = Arc::new(allowlist);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Encoding
    // ─────────────────────────────────────────────────────────────────────────

    /// Encode for the interception backend and seal the manifest.
    ///
    /// Repeated calls return the same bytes.
    pub fn encode(&mut self) -> SandboxResult<Bytes> {
        if let Some(bytes) = &self.encoded {
            return Ok(bytes.clone());
        }
        self.translator.validate()?;
        let bytes = codec::encode(self);
        tracing::debug!(
            pip_id = %self.pip_id,
            bytes = bytes.len(),
            nodes = self.root.node_count(),
            "Encoded file access manifest"
        );
        self.encoded = Some(bytes.clone());
        Ok(bytes)
    }

    /// Decode an encoded manifest. The result is sealed and has an empty
    /// allowlist.
    pub fn decode(data: &[u8]) -> SandboxResult<Self> {
        codec::decode(data)
    }

    pub fn is_sealed(&self) -> bool {
        self.encoded.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Effective policy for `path`: exact node policy, else nearest cone,
    /// else the default policy.
    pub fn find_policy_for(&self, path: &Path) -> PolicyLookup {
        self.root.lookup(&normalize(path), self.default_policy)
    }

    pub fn pip_id(&self) -> PipId {
        self.pip_id
    }

    pub fn flags(&self) -> ManifestFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: ManifestFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn default_policy(&self) -> FileAccessPolicy {
        self.default_policy
    }

    pub fn translator(&self) -> &DirectoryTranslator {
        &self.translator
    }

    pub fn breakaway_processes(&self) -> &[BreakawayChildProcess] {
        &self.breakaway
    }

    /// Whether a child started as `tool args` may escape interception.
    pub fn is_breakaway(&self, tool: &Path, args: &str) -> bool {
        self.breakaway.iter().any(|b| b.matches(tool, args))
    }

    pub fn allowlist(&self) -> &FileAccessAllowlist {
        &self.allowlist
    }

    /// Declared paths with their node and cone policies, in tree order.
    pub fn declared_policies(
        &self,
    ) -> Vec<(
        std::path::PathBuf,
        Option<FileAccessPolicy>,
        Option<FileAccessPolicy>,
    )> {
        let mut out = Vec::new();
        self.root.for_each_declared(|path, node| {
            out.push((path.to_path_buf(), node.node_policy, node.cone_policy));
        });
        out
    }
}

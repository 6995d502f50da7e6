//! Root jail execution context.

use std::path::{Path, PathBuf};

use pipwarden_config::{RootJailConfig, SandboxKind};

use crate::error::{SandboxError, SandboxResult};
use crate::paths::normalize;

const DEFAULT_PROGRAM: &str = "sudo";
const DEFAULT_ARGS: &[&str] = &["chroot"];

/// How to enter a root jail for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootJailInfo {
    pub root: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Program that enters the jail.
    pub program: String,
    /// Arguments placed between the program and the jail root.
    pub args: Vec<String>,
    pub disable_sandboxing: bool,
    pub disable_auditing: bool,
}

impl RootJailInfo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(&root.into()),
            uid: None,
            gid: None,
            program: DEFAULT_PROGRAM.to_string(),
            args: DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
            disable_sandboxing: false,
            disable_auditing: false,
        }
    }

    pub fn from_config(config: &RootJailConfig) -> Self {
        let mut info = Self::new(&config.root);
        info.uid = config.uid;
        info.gid = config.gid;
        if let Some(program) = &config.program {
            info.program = program.clone();
        }
        if let Some(args) = &config.args {
            info.args = args.clone();
        }
        info.disable_sandboxing = config.disable_sandboxing;
        info.disable_auditing = config.disable_auditing;
        info
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Sandbox kind to use given the configured one.
    pub fn effective_sandbox_kind(&self, configured: SandboxKind) -> SandboxKind {
        if self.disable_sandboxing {
            SandboxKind::None
        } else {
            configured
        }
    }

    /// Rewrite a host path into the jail's view of it.
    pub fn to_jail_path(&self, host_path: &Path) -> SandboxResult<PathBuf> {
        let host_path = normalize(host_path);
        let rest = host_path
            .strip_prefix(&self.root)
            .map_err(|_| SandboxError::OutsideJail {
                path: host_path.clone(),
                root: self.root.clone(),
            })?;
        Ok(Path::new("/").join(rest))
    }

    /// Rewrite a jail path back to the host.
    pub fn to_host_path(&self, jail_path: &Path) -> PathBuf {
        let jail_path = normalize(jail_path);
        match jail_path.strip_prefix("/") {
            Ok(rest) => self.root.join(rest),
            Err(_) => self.root.join(jail_path),
        }
    }

    /// Full command line that runs `tool args` inside the jail.
    ///
    /// Returns the program to spawn and its arguments.
    pub fn wrap_command(&self, tool: &Path, args: &[String]) -> SandboxResult<(String, Vec<String>)> {
        let mut argv = self.args.clone();
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            argv.push(format!("--userspec={uid}:{gid}"));
        }
        argv.push(self.root.to_string_lossy().into_owned());
        argv.push(self.to_jail_path(tool)?.to_string_lossy().into_owned());
        argv.extend(args.iter().cloned());
        Ok((self.program.clone(), argv))
    }
}

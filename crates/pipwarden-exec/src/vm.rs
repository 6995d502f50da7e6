//! VM command proxy protocol.
//!
//! The proxy is a host executable that forwards one command into the build
//! VM. It is invoked as `<proxy> <command> --input <request> --output
//! <response>` where both files are JSON with PascalCase keys. File names are
//! derived from the pip id so concurrent invocations sharing a VM never
//! collide.

use std::path::{Path, PathBuf};

use pipwarden_config::VmConfig;
use pipwarden_types::PipId;
use serde::{Deserialize, Serialize};

use crate::process::ProcessSpec;

/// Commands the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCommand {
    StartBuild,
    Run,
}

impl VmCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            VmCommand::StartBuild => "StartBuild",
            VmCommand::Run => "Run",
        }
    }
}

/// Prepares the VM for builds under the host's low-privilege account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartBuildRequest {
    pub host_low_privilege_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_low_privilege_password: Option<String>,
}

impl std::fmt::Debug for StartBuildRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartBuildRequest")
            .field("host_low_privilege_username", &self.host_low_privilege_username)
            .field(
                "host_low_privilege_password",
                &self.host_low_privilege_password.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

/// Runs one executable inside the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunRequest {
    pub abs_path: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
}

/// What the proxy reports about the executable it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunResult {
    pub process_exit_code: i32,
    #[serde(default)]
    pub std_out: String,
    #[serde(default)]
    pub std_err: String,
}

/// Request and response file locations for one pip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIoFiles {
    pub start_build_request: PathBuf,
    pub start_build_response: PathBuf,
    pub run_request: PathBuf,
    pub run_result: PathBuf,
    pub invocation_info: PathBuf,
    pub sandboxed_result: PathBuf,
}

impl VmIoFiles {
    pub fn new(io_dir: &Path, pip_id: PipId) -> Self {
        let stem = pip_id.file_stem();
        let file = |suffix: &str| io_dir.join(format!("{stem}.{suffix}.json"));
        Self {
            start_build_request: file("StartBuild"),
            start_build_response: file("StartBuild.Result"),
            run_request: file("Run"),
            run_result: file("Run.Result"),
            invocation_info: file("Info"),
            sandboxed_result: file("SandboxedProcessResult"),
        }
    }
}

/// Command line for one proxy call.
pub fn proxy_command(config: &VmConfig, command: VmCommand, input: &Path, output: &Path) -> ProcessSpec {
    ProcessSpec::new(&config.proxy_path).with_args([
        command.as_str().to_string(),
        "--input".to_string(),
        input.display().to_string(),
        "--output".to_string(),
        output.display().to_string(),
    ])
}

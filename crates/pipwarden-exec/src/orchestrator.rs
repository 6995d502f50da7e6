//! Out-of-process and VM execution of one invocation.
//!
//! Each run moves through `Init → Launch → AwaitCompletion → Reconcile` and
//! ends in `Success` or `Failure`. In VM mode the VM is initialised first;
//! a failed initialisation ends the run, nothing is retried.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use pipwarden_config::{ExternalConfig, PipwardenConfig, VmConfig};
use tokio_util::sync::CancellationToken;

use crate::info::{SandboxedInvocationInfo, read_json, write_json};
use crate::process::{ProcessOutput, ProcessSpec, run_process};
use crate::reconcile::{Layer, reconcile};
use crate::result::{ExternalExecutionResult, FailureClass};
use crate::vm::{RunRequest, RunResult, StartBuildRequest, VmCommand, VmIoFiles, proxy_command};

/// Where the tool runs.
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// Through the external helper on this host.
    ExternalTool(ExternalConfig),
    /// Through the external helper inside a VM, via the command proxy.
    Vm(VmConfig),
}

impl ExecutionMode {
    /// VM mode when a `[vm]` section is configured, external helper otherwise.
    pub fn from_config(config: &PipwardenConfig) -> Self {
        match &config.vm {
            Some(vm) => ExecutionMode::Vm(vm.clone()),
            None => ExecutionMode::ExternalTool(config.external.clone().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Launch,
    AwaitCompletion,
    Reconcile,
    Success,
    Failure,
}

/// Runs one invocation out of process.
///
/// [`kill`](Self::kill) may be called from any task at any time and any
/// number of times; the in-flight [`run`](Self::run) then finishes with the
/// killed flag set.
pub struct ExternalExecutionOrchestrator {
    mode: ExecutionMode,
    info: SandboxedInvocationInfo,
    cancel: CancellationToken,
    state: Mutex<OrchestratorState>,
}

impl ExternalExecutionOrchestrator {
    pub fn new(mode: ExecutionMode, info: SandboxedInvocationInfo) -> Self {
        Self {
            mode,
            info,
            cancel: CancellationToken::new(),
            state: Mutex::new(OrchestratorState::Init),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }

    pub fn kill(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(pip_id = %self.info.pip_id, "Kill requested");
        }
        self.cancel.cancel();
    }

    fn transition(&self, next: OrchestratorState) {
        let mut state = self.state.lock();
        tracing::trace!(pip_id = %self.info.pip_id, from = ?*state, to = ?next, "Orchestrator transition");
        *state = next;
    }

    /// Run to a terminal state.
    pub async fn run(&self) -> ExternalExecutionResult {
        let result = match &self.mode {
            ExecutionMode::ExternalTool(config) => self.run_external(config).await,
            ExecutionMode::Vm(config) => self.run_vm(config).await,
        };

        if result.is_success() {
            self.transition(OrchestratorState::Success);
        } else {
            tracing::debug!(
                pip_id = %self.info.pip_id,
                failure = ?result.failure,
                hint = ?result.hint,
                "External invocation failed"
            );
            self.transition(OrchestratorState::Failure);
        }
        result
    }

    async fn launch(&self, spec: &ProcessSpec) -> Result<ProcessOutput, ExternalExecutionResult> {
        self.transition(OrchestratorState::Launch);
        let running = run_process(spec, &self.cancel);
        self.transition(OrchestratorState::AwaitCompletion);
        running.await.map_err(|e| {
            ExternalExecutionResult::failed_without_output(FailureClass::LaunchFailure, e.to_string())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // External helper
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_external(&self, config: &ExternalConfig) -> ExternalExecutionResult {
        let work_dir = config
            .work_dir
            .clone()
            .unwrap_or_else(default_work_dir);
        let stem = self.info.pip_id.file_stem();
        let info_path = work_dir.join(format!("{stem}.info.json"));
        let result_path = work_dir.join(format!("{stem}.result.json"));

        if let Err(e) = write_json(&info_path, &self.info) {
            return ExternalExecutionResult::failed_without_output(FailureClass::LaunchFailure, e.to_string());
        }
        let _ = std::fs::remove_file(&result_path);

        let mut spec = ProcessSpec::new(&config.helper_path)
            .with_args(helper_args(&info_path, &result_path))
            .with_timeout(config.timeout());
        if let Some(timeout) = self.info.timeout() {
            spec.timeout = Some(timeout.min(config.timeout()));
        }

        let output = match self.launch(&spec).await {
            Ok(output) => output,
            Err(failure) => return failure,
        };

        self.transition(OrchestratorState::Reconcile);
        reconcile(
            &[Layer::new("external helper", FailureClass::ProxyFailure, output)],
            &result_path,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // VM
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_vm(&self, config: &VmConfig) -> ExternalExecutionResult {
        let files = VmIoFiles::new(&config.io_dir, self.info.pip_id);

        if let Some(failure) = self.init_vm(config, &files).await {
            return failure;
        }

        let request = RunRequest {
            abs_path: config.helper_path_in_vm.clone(),
            arguments: helper_args(&files.invocation_info, &files.sandboxed_result),
            working_directory: self.info.working_dir.clone(),
        };
        let prepared = write_json(&files.invocation_info, &self.info)
            .and_then(|()| write_json(&files.run_request, &request));
        if let Err(e) = prepared {
            return ExternalExecutionResult::failed_without_output(FailureClass::LaunchFailure, e.to_string());
        }
        for stale in [&files.run_result, &files.sandboxed_result] {
            let _ = std::fs::remove_file(stale);
        }

        let spec = proxy_command(config, VmCommand::Run, &files.run_request, &files.run_result)
            .with_timeout(config.timeout());
        let output = match self.launch(&spec).await {
            Ok(output) => output,
            Err(failure) => return failure,
        };

        self.transition(OrchestratorState::Reconcile);
        let mut proxy = Layer::new("vm proxy", FailureClass::ProxyFailure, output);
        let mut layers = Vec::with_capacity(2);
        if !proxy.failed() {
            match read_json::<RunResult>(&files.run_result) {
                Ok(run) => layers.push(Layer::new(
                    "inner tool",
                    FailureClass::InnerToolFailure,
                    ProcessOutput {
                        exit_code: Some(run.process_exit_code),
                        stdout: run.std_out,
                        stderr: run.std_err,
                        ..Default::default()
                    },
                )),
                Err(e) => proxy = proxy.with_violation(format!("unreadable run result: {e}")),
            }
        }
        layers.insert(0, proxy);
        reconcile(&layers, &files.sandboxed_result)
    }

    async fn init_vm(&self, config: &VmConfig, files: &VmIoFiles) -> Option<ExternalExecutionResult> {
        let request = StartBuildRequest {
            host_low_privilege_username: config.user.clone(),
            host_low_privilege_password: config.password(),
        };
        if let Err(e) = write_json(&files.start_build_request, &request) {
            return Some(ExternalExecutionResult::failed_without_output(
                FailureClass::LaunchFailure,
                e.to_string(),
            ));
        }

        let spec = proxy_command(
            config,
            VmCommand::StartBuild,
            &files.start_build_request,
            &files.start_build_response,
        )
        .with_timeout(config.init_timeout());
        let output = match self.launch(&spec).await {
            Ok(output) => output,
            Err(failure) => return Some(failure),
        };

        let failure = Layer::new("vm initialization", FailureClass::ProxyFailure, output).failure();
        if failure.is_some() {
            tracing::warn!(pip_id = %self.info.pip_id, "VM initialization failed");
        }
        failure
    }
}

fn helper_args(info: &Path, result: &Path) -> Vec<String> {
    vec![
        "exec".to_string(),
        "--info".to_string(),
        info.display().to_string(),
        "--result".to_string(),
        result.display().to_string(),
    ]
}

/// Default work directory for helper files.
pub fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("pipwarden")
}

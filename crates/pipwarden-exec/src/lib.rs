//! Execution of sandboxed tool invocations.
//!
//! Three ways to run a tool:
//!
//! - [`SandboxedRunner`]: in process, under a [`SandboxConnection`](pipwarden_sandbox::SandboxConnection)
//!   backend, collecting the observed file accesses
//! - [`ExternalExecutionOrchestrator`] in [`ExecutionMode::ExternalTool`]: through the
//!   `pipwarden exec` helper on this host
//! - [`ExternalExecutionOrchestrator`] in [`ExecutionMode::Vm`]: through the helper
//!   inside a build VM, via the VM command proxy
//!
//! Every path ends in an [`ExternalExecutionResult`] whose
//! [`FailureClass`] says which layer failed.

mod error;
pub mod executor;
pub mod info;
pub mod orchestrator;
pub mod process;
pub mod reconcile;
pub mod result;
pub mod runner;
pub mod vm;

pub use error::{ExecError, ExecResult};
pub use info::{SandboxedInvocationInfo, SandboxedProcessResult};
pub use orchestrator::{ExecutionMode, ExternalExecutionOrchestrator, OrchestratorState};
pub use process::{ProcessOutput, ProcessSpec, run_process};
pub use result::{ExternalExecutionResult, FailureClass};
pub use runner::{ProcessLauncher, SandboxedRun, SandboxedRunner, SuspendedProcess};

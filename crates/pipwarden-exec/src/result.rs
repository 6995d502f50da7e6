//! Failure-classified result of an external invocation.

use serde::{Deserialize, Serialize};

use crate::info::SandboxedProcessResult;
use crate::process::ProcessOutput;

/// Why an invocation failed. Exactly one class applies to a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The outermost wrapper (external helper or VM command proxy) was
    /// killed, timed out, exited non-zero or broke its output contract.
    ProxyFailure,
    /// The wrapper succeeded but the tool it ran reported a non-zero exit.
    InnerToolFailure,
    /// Every layer succeeded but the sandboxed result file is unusable.
    MalformedResult,
    /// The sandbox backend refused the pip; the tool was never resumed.
    BackendRegistration,
    /// Nothing could be launched.
    LaunchFailure,
    /// The report channel went quiet past the drought timeout.
    ReportStall,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureClass::ProxyFailure => "proxy failure",
            FailureClass::InnerToolFailure => "inner tool failure",
            FailureClass::MalformedResult => "malformed result",
            FailureClass::BackendRegistration => "backend registration failure",
            FailureClass::LaunchFailure => "launch failure",
            FailureClass::ReportStall => "report stall",
        };
        f.write_str(name)
    }
}

/// Outcome handed back to the scheduler. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalExecutionResult {
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<FailureClass>,
    /// Short diagnostic for failures.
    pub hint: Option<String>,
    /// Present only on success.
    pub result: Option<SandboxedProcessResult>,
}

impl ExternalExecutionResult {
    pub fn success(result: SandboxedProcessResult) -> Self {
        Self {
            exit_code: Some(result.exit_code),
            killed: result.killed,
            timed_out: result.timed_out,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            failure: None,
            hint: None,
            result: Some(result),
        }
    }

    /// The helper ran, but the tool it launched was killed or timed out.
    pub fn tool_killed(result: SandboxedProcessResult) -> Self {
        let hint = if result.timed_out { "tool timed out" } else { "tool was killed" };
        Self {
            exit_code: None,
            killed: true,
            timed_out: result.timed_out,
            stdout: result.stdout,
            stderr: result.stderr,
            failure: Some(FailureClass::InnerToolFailure),
            hint: Some(hint.to_string()),
            result: None,
        }
    }

    /// A failure carrying whatever output the failing layer produced.
    pub fn failure(class: FailureClass, output: &ProcessOutput, hint: impl Into<String>) -> Self {
        Self {
            exit_code: output.exit_code,
            killed: output.killed,
            timed_out: output.timed_out,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            failure: Some(class),
            hint: Some(hint.into()),
            result: None,
        }
    }

    /// A failure with no process output at all.
    pub fn failed_without_output(class: FailureClass, hint: impl Into<String>) -> Self {
        Self::failure(class, &ProcessOutput::default(), hint)
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

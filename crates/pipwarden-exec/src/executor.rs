//! Helper side of an external invocation.
//!
//! Reads the serialized [`SandboxedInvocationInfo`], runs the tool (inside
//! the root jail when one is configured), and writes the
//! [`SandboxedProcessResult`]. A tool that exits non-zero still yields a
//! result; only failing to run it at all is an error.

use std::path::Path;

use chrono::Utc;
use pipwarden_config::SandboxKind;
use pipwarden_sandbox::RootJailInfo;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, ExecResult};
use crate::info::{SandboxedInvocationInfo, SandboxedProcessResult, read_json, write_json};
use crate::process::{ProcessSpec, run_process};

/// Command line for the invocation, wrapped for the jail when needed.
pub fn build_command(info: &SandboxedInvocationInfo) -> ExecResult<(ProcessSpec, SandboxKind)> {
    if !info.tool_path.is_absolute() {
        return Err(ExecError::InvalidInvocation(format!(
            "tool path must be absolute: {}",
            info.tool_path.display()
        )));
    }

    let (spec, kind) = match &info.jail {
        Some(config) => {
            let jail = RootJailInfo::from_config(config);
            let (program, args) = jail.wrap_command(&info.tool_path, &info.args)?;
            let kind = jail.effective_sandbox_kind(info.sandbox_kind);
            if jail.disable_auditing {
                tracing::debug!(pip_id = %info.pip_id, "Auditing disabled inside jail");
            }
            (ProcessSpec::new(program).with_args(args), kind)
        }
        None => (
            ProcessSpec::new(&info.tool_path).with_args(info.args.iter().cloned()),
            info.sandbox_kind,
        ),
    };

    let mut spec = spec
        .with_working_dir(&info.working_dir)
        .with_env(info.env.clone());
    spec.timeout = info.timeout();
    Ok((spec, kind))
}

/// Run the invocation and return what happened.
pub async fn execute(
    info: &SandboxedInvocationInfo,
    cancel: &CancellationToken,
) -> ExecResult<SandboxedProcessResult> {
    let (spec, sandbox_kind) = build_command(info)?;
    tracing::info!(
        pip_id = %info.pip_id,
        command = %info.command_line(),
        sandbox = ?sandbox_kind,
        "Running tool"
    );

    let started_at = Utc::now();
    let output = run_process(&spec, cancel).await?;
    let finished_at = Utc::now();

    let mut stdout = output.stdout;
    let mut stderr = output.stderr;
    if let Some(path) = &info.stdout_path {
        redirect(path, &mut stdout)?;
    }
    if let Some(path) = &info.stderr_path {
        redirect(path, &mut stderr)?;
    }

    let exit_code = output.exit_code.unwrap_or(-1);
    tracing::info!(
        pip_id = %info.pip_id,
        exit_code,
        killed = output.killed,
        timed_out = output.timed_out,
        "Tool finished"
    );

    Ok(SandboxedProcessResult {
        pip_id: info.pip_id,
        exit_code,
        killed: output.killed,
        timed_out: output.timed_out,
        stdout,
        stderr,
        sandbox_kind,
        accesses: Vec::new(),
        processes: Vec::new(),
        started_at,
        finished_at,
    })
}

/// Read the info file, run, and write the result file.
pub async fn execute_files(
    info_path: &Path,
    result_path: &Path,
    cancel: &CancellationToken,
) -> ExecResult<SandboxedProcessResult> {
    let info: SandboxedInvocationInfo = read_json(info_path)?;
    let result = execute(&info, cancel).await?;
    write_json(result_path, &result)?;
    Ok(result)
}

fn redirect(path: &Path, captured: &mut String) -> ExecResult<()> {
    std::fs::write(path, captured.as_bytes()).map_err(|source| ExecError::File {
        path: path.to_path_buf(),
        source,
    })?;
    captured.clear();
    Ok(())
}

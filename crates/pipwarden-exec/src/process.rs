//! Child process execution with timeout and cancellation.
//!
//! On Unix every child leads its own process group, and a kill signals the
//! whole group so that tools started by a helper or proxy die with it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, ExecResult};

/// How long to wait for output pipes after a kill; grandchildren may hold them.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A program to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.killed
    }
}

/// Run `spec` to completion, capturing stdout and stderr.
///
/// Cancelling `cancel` or exceeding the timeout kills the process; the
/// returned output then has `killed` set, plus `timed_out` for the latter.
/// Only a failure to spawn or wait is an error.
pub async fn run_process(spec: &ProcessSpec, cancel: &CancellationToken) -> ExecResult<ProcessOutput> {
    let program = spec.program.display().to_string();
    if cancel.is_cancelled() {
        tracing::debug!(program = %program, "Cancelled before launch");
        return Ok(ProcessOutput {
            killed: true,
            ..Default::default()
        });
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(program = %program, pid, "Spawned process");

    let stdout = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf).await;
            buf
        })
    });

    let deadline = async {
        match spec.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    let mut output = ProcessOutput::default();
    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = cancel.cancelled() => {
            output.killed = true;
            None
        }
        _ = deadline => {
            output.killed = true;
            output.timed_out = true;
            None
        }
    };

    let status = match status {
        Some(status) => status,
        None => {
            tracing::debug!(program = %program, timed_out = output.timed_out, "Killing process group");
            kill_group(pid);
            let _ = child.start_kill();
            child.wait().await?
        }
    };
    if !output.killed {
        output.exit_code = status.code();
    }

    let grace = output.killed.then_some(KILL_DRAIN_GRACE);
    (output.stdout, output.stderr) = tokio::join!(collect(stdout, grace), collect(stderr, grace));
    Ok(output)
}

/// SIGKILL the process group led by `pid`. Best effort: the group may be gone.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        tracing::trace!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn collect(reader: Option<tokio::task::JoinHandle<Vec<u8>>>, grace: Option<Duration>) -> String {
    let Some(handle) = reader else {
        return String::new();
    };
    let bytes = match grace {
        None => handle.await.unwrap_or_default(),
        Some(grace) => {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    abort.abort();
                    Vec::new()
                }
            }
        }
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Whether `pid` is a live, non-zombie process.
#[cfg(all(test, unix))]
pub(crate) fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // State follows the parenthesised command name
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) if std::path::Path::new("/proc/self").exists() => false,
        // SAFETY: signal 0 only checks for existence.
        Err(_) => unsafe { libc::kill(pid, 0) == 0 },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = run_process(&sh("echo out; echo err >&2; exit 3"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.killed);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let start = Instant::now();
        let output = run_process(
            &sh("exec sleep 30").with_timeout(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(output.killed);
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_kills_and_is_idempotent() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
            trigger.cancel();
        });
        let output = run_process(&sh("exec sleep 30"), &cancel).await.unwrap();
        assert!(output.killed);
        assert!(!output.timed_out);

        // Already cancelled: nothing is spawned
        let output = run_process(&sh("exit 0"), &cancel).await.unwrap();
        assert!(output.killed);
    }

    #[tokio::test]
    async fn test_kill_takes_down_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("inner.pid");
        let script = format!("sleep 300 & echo $! > {}; wait", pidfile.display());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let output = run_process(&sh(&script), &cancel).await.unwrap();
        assert!(output.killed);
        assert!(start.elapsed() < Duration::from_millis(1500));

        let inner: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // Reaped by init shortly after the kill
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(inner) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(inner), "inner tool {inner} survived the kill");
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("PW_TEST".to_string(), "value".to_string());
        let output = run_process(
            &sh("echo $PW_TEST; pwd").with_env(env).with_working_dir(dir.path()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let lines: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(lines[0], "value");
        assert!(lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let err = run_process(&ProcessSpec::new("/nonexistent/tool"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}

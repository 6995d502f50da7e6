//! Sandboxed launch driven through a [`SandboxConnection`].
//!
//! Process creation stays behind [`ProcessLauncher`]: the runner only needs a
//! process that starts suspended, can be resumed, waited on and killed.
//!
//! Each run also gets an augmented report channel, named to the tool through
//! [`AUGMENTED_CHANNEL_ENV`]. The runner tails it alongside the backend's
//! reports; accesses read from it are the only ones with a trusted status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipwarden_sandbox::{
    AUGMENTED_CHANNEL_ENV, AccessReport, AccessReportProcessor, AugmentedChannel, ChannelProcess,
    FileAccessManifest, FileSystemView, ObservedAccesses, SandboxConnection, SandboxedProcess,
    SharedOpaqueJournal, SymlinkedAccessResolver,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ExecResult;
use crate::info::SandboxedInvocationInfo;
use crate::process::ProcessOutput;
use crate::result::{ExternalExecutionResult, FailureClass};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_FINISH_ATTEMPTS: usize = 100;

/// A process created suspended.
#[async_trait]
pub trait SuspendedProcess: Send {
    fn process_id(&self) -> u32;

    fn resume(&mut self) -> ExecResult<()>;

    /// Wait for exit and return the exit code. Must be cancel safe.
    async fn wait(&mut self) -> ExecResult<i32>;

    fn kill(&mut self);
}

/// Creates suspended processes for invocations.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch_suspended(
        &self,
        info: &SandboxedInvocationInfo,
    ) -> ExecResult<Box<dyn SuspendedProcess>>;
}

/// Result of a sandboxed run.
#[derive(Debug, Clone)]
pub struct SandboxedRun {
    pub result: ExternalExecutionResult,
    /// `None` when the tool never ran.
    pub observed: Option<ObservedAccesses>,
}

impl SandboxedRun {
    fn not_run(class: FailureClass, hint: impl Into<String>) -> Self {
        Self {
            result: ExternalExecutionResult::failed_without_output(class, hint),
            observed: None,
        }
    }
}

/// Runs invocations under a sandbox backend.
pub struct SandboxedRunner {
    connection: Arc<dyn SandboxConnection>,
    launcher: Arc<dyn ProcessLauncher>,
    fs: Arc<dyn FileSystemView>,
    resolver: Arc<SymlinkedAccessResolver>,
    channel_dir: PathBuf,
    drought_timeout: Duration,
    poll_interval: Duration,
    finish_attempts: usize,
}

impl SandboxedRunner {
    /// The resolver shares its caches across every run of this runner.
    pub fn new(
        connection: Arc<dyn SandboxConnection>,
        launcher: Arc<dyn ProcessLauncher>,
        fs: Arc<dyn FileSystemView>,
    ) -> Self {
        let resolver = Arc::new(SymlinkedAccessResolver::new(fs.clone()));
        Self {
            connection,
            launcher,
            fs,
            resolver,
            channel_dir: std::env::temp_dir().join("pipwarden"),
            drought_timeout: Duration::from_secs(30),
            poll_interval: DEFAULT_POLL_INTERVAL,
            finish_attempts: DEFAULT_FINISH_ATTEMPTS,
        }
    }

    pub fn with_drought_timeout(mut self, timeout: Duration) -> Self {
        self.drought_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Directory holding the per-run augmented report channels.
    pub fn with_channel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.channel_dir = dir.into();
        self
    }

    pub async fn run(
        &self,
        manifest: Arc<FileAccessManifest>,
        info: &SandboxedInvocationInfo,
        journal: Option<SharedOpaqueJournal>,
        cancel: CancellationToken,
    ) -> SandboxedRun {
        let pip_id = manifest.pip_id();

        let mut augmented = match AugmentedChannel::create(&self.channel_dir, pip_id) {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::warn!(pip_id = %pip_id, error = %e, "No augmented report channel for this run");
                None
            }
        };
        let mut launch_info = info.clone();
        if let Some(channel) = &augmented {
            launch_info = launch_info.with_env(AUGMENTED_CHANNEL_ENV, channel.path().display().to_string());
        }

        let mut child = match self.launcher.launch_suspended(&launch_info).await {
            Ok(child) => child,
            Err(e) => {
                if let Some(channel) = augmented {
                    channel.remove();
                }
                return SandboxedRun::not_run(FailureClass::LaunchFailure, e.to_string());
            }
        };

        let (channel, mut reports) = ChannelProcess::new(pip_id);
        channel.set_process_id(child.process_id());
        let process: Arc<dyn SandboxedProcess> = Arc::new(channel);
        let (completion_tx, mut completion) = oneshot::channel();

        if !self
            .connection
            .notify_pip_ready(manifest.clone(), process.clone(), completion_tx)
        {
            child.kill();
            if let Some(channel) = augmented {
                channel.remove();
            }
            return SandboxedRun::not_run(
                FailureClass::BackendRegistration,
                "sandbox backend rejected pip",
            );
        }
        if !self.connection.notify_pip_started(&manifest, process.as_ref()) {
            tracing::warn!(pip_id = %pip_id, pid = child.process_id(), "Backend registration failed; not resuming");
            child.kill();
            self.release(&manifest, process.as_ref()).await;
            if let Some(channel) = augmented {
                channel.remove();
            }
            return SandboxedRun::not_run(
                FailureClass::BackendRegistration,
                "sandbox backend could not attribute the process",
            );
        }

        let mut processor = AccessReportProcessor::new(manifest.clone(), self.fs.clone(), &info.tool_path)
            .with_resolver(self.resolver.clone());
        if let Some(journal) = journal {
            processor = processor.with_journal(journal);
        }

        if let Err(e) = child.resume() {
            child.kill();
            self.release(&manifest, process.as_ref()).await;
            if let Some(channel) = augmented {
                channel.remove();
            }
            return SandboxedRun::not_run(FailureClass::LaunchFailure, e.to_string());
        }

        let output = self
            .await_exit(
                child.as_mut(),
                &mut reports,
                augmented.as_mut(),
                &mut processor,
                info,
                &cancel,
            )
            .await;
        self.connection.notify_root_process_exited(pip_id, process.as_ref());

        let stalled = !self
            .await_reports(&mut completion, &mut reports, augmented.as_mut(), &mut processor)
            .await;
        while let Ok(report) = reports.try_recv() {
            processor.process(report);
        }
        if let Some(mut channel) = augmented {
            tail_channel(&mut channel, &mut processor);
            channel.remove();
        }
        self.release(&manifest, process.as_ref()).await;

        let observed = processor.finish();
        let result = if stalled {
            ExternalExecutionResult::failure(
                FailureClass::ReportStall,
                &output,
                format!("no reports for {:?} before the process tree completed", self.drought_timeout),
            )
        } else if output.killed {
            let hint = if output.timed_out { "tool timed out" } else { "tool was killed" };
            ExternalExecutionResult::failure(FailureClass::InnerToolFailure, &output, hint)
        } else {
            ExternalExecutionResult {
                exit_code: output.exit_code,
                killed: false,
                timed_out: false,
                stdout: output.stdout,
                stderr: output.stderr,
                failure: None,
                hint: observed
                    .journal_fault
                    .as_ref()
                    .map(ToString::to_string),
                result: None,
            }
        };

        SandboxedRun {
            result,
            observed: Some(observed),
        }
    }

    /// Wait for the root process while consuming reports.
    async fn await_exit(
        &self,
        child: &mut dyn SuspendedProcess,
        reports: &mut mpsc::UnboundedReceiver<AccessReport>,
        mut augmented: Option<&mut AugmentedChannel>,
        processor: &mut AccessReportProcessor,
        info: &SandboxedInvocationInfo,
        cancel: &CancellationToken,
    ) -> ProcessOutput {
        enum Step {
            Exited(ExecResult<i32>),
            Report(AccessReport),
            Tail,
            Stop { timed_out: bool },
        }

        let deadline = info.timeout().map(|t| tokio::time::Instant::now() + t);
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut output = ProcessOutput::default();
        loop {
            let step = tokio::select! {
                exit = child.wait() => Step::Exited(exit),
                Some(report) = reports.recv() => Step::Report(report),
                _ = ticker.tick(), if augmented.is_some() => Step::Tail,
                _ = cancel.cancelled() => Step::Stop { timed_out: false },
                _ = sleep_until(deadline) => Step::Stop { timed_out: true },
            };
            match step {
                Step::Report(report) => processor.process(report),
                Step::Tail => {
                    if let Some(channel) = augmented.as_deref_mut() {
                        tail_channel(channel, processor);
                    }
                }
                Step::Exited(Ok(code)) => {
                    output.exit_code = Some(code);
                    return output;
                }
                Step::Exited(Err(e)) => {
                    tracing::warn!(error = %e, "Lost track of sandboxed process");
                    output.killed = true;
                    child.kill();
                    return output;
                }
                Step::Stop { timed_out } => {
                    output.killed = true;
                    output.timed_out = timed_out;
                    child.kill();
                    let _ = child.wait().await;
                    return output;
                }
            }
        }
    }

    /// Consume reports until the backend signals completion.
    ///
    /// Returns false when the report channel stayed quiet longer than the
    /// drought timeout first.
    async fn await_reports(
        &self,
        completion: &mut oneshot::Receiver<()>,
        reports: &mut mpsc::UnboundedReceiver<AccessReport>,
        mut augmented: Option<&mut AugmentedChannel>,
        processor: &mut AccessReportProcessor,
    ) -> bool {
        loop {
            tokio::select! {
                _ = &mut *completion => return true,
                Some(report) = reports.recv() => processor.process(report),
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Some(channel) = augmented.as_deref_mut() {
                        tail_channel(channel, processor);
                    }
                    let drought = self.connection.current_drought();
                    if drought > self.drought_timeout {
                        tracing::warn!(
                            drought = ?drought,
                            oldest = ?self.connection.min_report_queue_enqueue_time(),
                            "Report channel stalled"
                        );
                        return false;
                    }
                }
            }
        }
    }

    async fn release(&self, manifest: &FileAccessManifest, process: &dyn SandboxedProcess) {
        let pip_id = manifest.pip_id();
        for _ in 0..self.finish_attempts {
            if self.connection.notify_pip_finished(pip_id, process) {
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        tracing::warn!(pip_id = %pip_id, "Sandbox backend did not release pip resources");
    }
}

/// Feed accesses appended to the augmented channel to the processor.
fn tail_channel(channel: &mut AugmentedChannel, processor: &mut AccessReportProcessor) {
    match channel.read_new() {
        Ok(accesses) => {
            for access in accesses {
                processor.process(AccessReport::FileAccess(access));
            }
        }
        Err(e) => {
            tracing::warn!(channel = %channel.path().display(), error = %e, "Cannot read augmented report channel");
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

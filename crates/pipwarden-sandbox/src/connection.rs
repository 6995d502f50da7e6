//! Contract between the engine and a native interception backend.
//!
//! [`SandboxConnection`] is what every platform backend implements. The
//! engine drives it in a fixed order for each pip:
//!
//! 1. `notify_pip_ready` while the tool is still suspended
//! 2. `notify_pip_started` once it has a process id; on `false` the tool must
//!    not be resumed
//! 3. `notify_root_process_exited`, then `notify_pip_finished` until it
//!    returns `true`
//!
//! [`QueuedSandboxConnection`] is the in-process half of a native backend:
//! raw report lines land in a set of queues, and `pump` decodes them and
//! routes each to the pip owning the reporting process. Lines arriving here
//! are observations; a trusted status only comes through a pip's augmented
//! channel. A child matching one of the manifest's breakaway entries leaves
//! the pip: it is announced once and then neither tracked nor attributed.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use pipwarden_config::{SandboxConfig, SandboxKind};
use pipwarden_types::{
    FileAccessStatusMethod, ManifestFlags, ParsedReportLine, PipId, ReportedFileAccess,
    ReportedFileOperation, ReportedProcess, parse_line,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manifest::FileAccessManifest;

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded event delivered to a pip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessReport {
    FileAccess(ReportedFileAccess),
    ProcessStarted(ReportedProcess),
    ProcessExited { process_id: u32, exit_code: i32 },
    /// Every process of the pip has exited and its reports were delivered.
    ProcessTreeCompleted,
}

/// The engine-side view of a sandboxed process.
pub trait SandboxedProcess: Send + Sync {
    fn pip_id(&self) -> PipId;

    /// OS process id, or 0 before the process was created.
    fn process_id(&self) -> u32;

    /// Deliver a decoded report.
    fn post_report(&self, report: AccessReport);
}

/// [`SandboxedProcess`] backed by an unbounded channel.
#[derive(Debug)]
pub struct ChannelProcess {
    pip_id: PipId,
    process_id: AtomicU32,
    reports: mpsc::UnboundedSender<AccessReport>,
}

impl ChannelProcess {
    pub fn new(pip_id: PipId) -> (Self, mpsc::UnboundedReceiver<AccessReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pip_id,
                process_id: AtomicU32::new(0),
                reports: tx,
            },
            rx,
        )
    }

    pub fn set_process_id(&self, process_id: u32) {
        self.process_id.store(process_id, Ordering::SeqCst);
    }
}

impl SandboxedProcess for ChannelProcess {
    fn pip_id(&self) -> PipId {
        self.pip_id
    }

    fn process_id(&self) -> u32 {
        self.process_id.load(Ordering::SeqCst)
    }

    fn post_report(&self, report: AccessReport) {
        // The receiver is gone once the pip was torn down; late reports are moot.
        let _ = self.reports.send(report);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Behavioral contract every sandbox backend implements.
pub trait SandboxConnection: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// Register bookkeeping for a pip before its tool is resumed.
    ///
    /// `completion` fires when all reports for the pip were delivered.
    /// Returns false if the pip is already registered.
    fn notify_pip_ready(
        &self,
        manifest: Arc<FileAccessManifest>,
        process: Arc<dyn SandboxedProcess>,
        completion: oneshot::Sender<()>,
    ) -> bool;

    /// Start attributing reports from `process.process_id()` to the pip.
    ///
    /// Returns false if registration failed; the caller must not resume the
    /// process.
    fn notify_pip_started(&self, manifest: &FileAccessManifest, process: &dyn SandboxedProcess)
    -> bool;

    /// Host resource pressure sample.
    fn notify_usage(&self, cpu_basis_points: u32, available_ram_mb: u64);

    fn notify_root_process_exited(&self, pip_id: PipId, process: &dyn SandboxedProcess);

    /// Release per-pip resources. Returns false while that is not yet
    /// possible; callers poll until true.
    fn notify_pip_finished(&self, pip_id: PipId, process: &dyn SandboxedProcess) -> bool;

    /// A process of the pip was terminated by the engine.
    fn notify_pip_process_terminated(&self, pip_id: PipId, process_id: u32);

    /// Enqueue instant of the oldest report not yet dequeued.
    fn min_report_queue_enqueue_time(&self) -> Option<Instant>;

    /// Time since the last report arrived on any queue.
    fn current_drought(&self) -> Duration;
}

// ─────────────────────────────────────────────────────────────────────────────
// Queued backend
// ─────────────────────────────────────────────────────────────────────────────

/// Batch size per queue while available RAM is below the threshold.
const THROTTLED_BATCH: usize = 64;

struct QueuedReport {
    enqueued_at: Instant,
    report: ParsedReportLine,
}

struct PipState {
    manifest: Arc<FileAccessManifest>,
    process: Arc<dyn SandboxedProcess>,
    completion: Option<oneshot::Sender<()>>,
    root_pid: Option<u32>,
    live: HashSet<u32>,
    root_exited: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub cpu_basis_points: u32,
    pub available_ram_mb: u64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub delivered: u64,
    /// Reports from processes no pip owns.
    pub dropped: u64,
    /// Lines that failed to decode.
    pub malformed: u64,
}

/// Queue-based backend connection.
pub struct QueuedSandboxConnection {
    kind: SandboxKind,
    queues: Vec<Mutex<VecDeque<QueuedReport>>>,
    pips: DashMap<PipId, Mutex<PipState>>,
    owners: DashMap<u32, PipId>,
    last_report: Mutex<Instant>,
    usage: Mutex<Option<UsageSample>>,
    low_memory_threshold_mb: u64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl std::fmt::Debug for QueuedSandboxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedSandboxConnection")
            .field("kind", &self.kind)
            .field("queues", &self.queues.len())
            .field("pips", &self.pips.len())
            .finish()
    }
}

impl QueuedSandboxConnection {
    pub fn new(kind: SandboxKind, queue_count: usize) -> Self {
        Self {
            kind,
            queues: (0..queue_count.max(1))
                .map(|_| Mutex::new(VecDeque::new()))
                .collect(),
            pips: DashMap::new(),
            owners: DashMap::new(),
            last_report: Mutex::new(Instant::now()),
            usage: Mutex::new(None),
            low_memory_threshold_mb: 0,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.kind, config.report_queue_count)
            .with_low_memory_threshold(config.low_memory_threshold_mb)
    }

    pub fn with_low_memory_threshold(mut self, threshold_mb: u64) -> Self {
        self.low_memory_threshold_mb = threshold_mb;
        self
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    pub fn last_usage(&self) -> Option<UsageSample> {
        *self.usage.lock()
    }

    /// Enqueue one raw report line on `queue` (taken modulo the queue count).
    ///
    /// Returns false if the line could not be decoded.
    /// An explicit-report flag on the line is cleared.
    pub fn ingest_line(&self, queue: usize, line: &str) -> bool {
        let mut report = match parse_line(line) {
            Ok(report) => report,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, line, "Dropping malformed report line");
                return false;
            }
        };
        if report.access.explicitly_reported {
            tracing::debug!(
                pid = report.access.process_id,
                path = %report.access.path.display(),
                "Ignoring explicit status on backend report"
            );
            report.access.explicitly_reported = false;
            report.access.method = FileAccessStatusMethod::PolicyBased;
        }
        let now = Instant::now();
        self.queues[queue % self.queues.len()]
            .lock()
            .push_back(QueuedReport {
                enqueued_at: now,
                report,
            });
        *self.last_report.lock() = now;
        true
    }

    fn batch_size(&self) -> usize {
        match *self.usage.lock() {
            Some(sample) if sample.available_ram_mb < self.low_memory_threshold_mb => {
                THROTTLED_BATCH
            }
            _ => usize::MAX,
        }
    }

    /// Drain queued reports and route them. Returns how many were dequeued.
    pub fn pump(&self) -> usize {
        let batch = self.batch_size();
        let mut processed = 0;
        for queue in &self.queues {
            let drained: Vec<QueuedReport> = {
                let mut queue = queue.lock();
                let n = batch.min(queue.len());
                queue.drain(..n).collect()
            };
            processed += drained.len();
            for queued in drained {
                self.route(queued.report);
            }
        }
        if processed > 0 {
            tracing::trace!(processed, "Pumped report queues");
        }
        processed
    }

    /// Pump on an interval until cancelled.
    pub fn spawn_pump(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.pump();
                    }
                }
            }
            self.pump();
        })
    }

    fn route(&self, parsed: ParsedReportLine) {
        let ParsedReportLine {
            access,
            parent_process_id,
        } = parsed;
        let pid = access.process_id;

        let owner = match self.owners.get(&pid).map(|o| *o) {
            Some(owner) => Some(owner),
            None if access.operation == ReportedFileOperation::Process => {
                self.adopt_child(pid, parent_process_id)
            }
            None => None,
        };
        let Some(pip_id) = owner else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(pid, operation = %access.operation, "Report from unknown process dropped");
            return;
        };
        let Some(entry) = self.pips.get(&pip_id) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let mut state = entry.lock();

        match access.operation {
            ReportedFileOperation::Process => {
                let breakaway = state.root_pid != Some(pid)
                    && state
                        .manifest
                        .is_breakaway(&access.path, access.process_args.as_deref().unwrap_or(""));
                let mut process = ReportedProcess::new(pid, access.path.clone());
                if let Some(parent) = parent_process_id {
                    process = process.with_parent(parent);
                }
                if let Some(args) = access.process_args {
                    process = process.with_args(args);
                }
                if breakaway {
                    self.owners.remove(&pid);
                    tracing::debug!(pip_id = %pip_id, pid, tool = %access.path.display(), "Breakaway process left the sandbox");
                } else {
                    state.live.insert(pid);
                }
                state.process.post_report(AccessReport::ProcessStarted(process));
            }
            ReportedFileOperation::ProcessExit => {
                state.live.remove(&pid);
                if state.root_pid == Some(pid) {
                    state.root_exited = true;
                }
                state.process.post_report(AccessReport::ProcessExited {
                    process_id: pid,
                    exit_code: access.error as i32,
                });
            }
            ReportedFileOperation::ProcessTreeCompleted => {
                state.live.clear();
                state.root_exited = true;
            }
            _ => state.process.post_report(AccessReport::FileAccess(access)),
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.try_complete(pip_id, &mut state);
    }

    /// Attribute a new process to the pip that owns its parent.
    fn adopt_child(&self, pid: u32, parent: Option<u32>) -> Option<PipId> {
        let pip_id = *self.owners.get(&parent?)?;
        let monitored = self.pips.get(&pip_id).is_some_and(|state| {
            state
                .lock()
                .manifest
                .has_flag(ManifestFlags::MONITOR_CHILD_PROCESSES)
        });
        if !monitored {
            return None;
        }
        self.owners.insert(pid, pip_id);
        Some(pip_id)
    }

    fn has_pending(&self, pip_id: PipId) -> bool {
        self.queues.iter().any(|queue| {
            queue.lock().iter().any(|q| {
                self.owners
                    .get(&q.report.access.process_id)
                    .is_some_and(|owner| *owner == pip_id)
                    || q.report
                        .parent_process_id
                        .and_then(|parent| self.owners.get(&parent).map(|o| *o))
                        == Some(pip_id)
            })
        })
    }

    fn try_complete(&self, pip_id: PipId, state: &mut PipState) {
        if state.completion.is_none() || !state.root_exited || !state.live.is_empty() {
            return;
        }
        if self.has_pending(pip_id) {
            return;
        }
        state.process.post_report(AccessReport::ProcessTreeCompleted);
        if let Some(completion) = state.completion.take() {
            let _ = completion.send(());
        }
        tracing::debug!(pip_id = %pip_id, "Process tree completed");
    }

    fn with_pip<R>(&self, pip_id: PipId, f: impl FnOnce(&mut PipState) -> R) -> Option<R> {
        let entry = self.pips.get(&pip_id)?;
        let mut state = entry.lock();
        Some(f(&mut state))
    }
}

impl SandboxConnection for QueuedSandboxConnection {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    fn notify_pip_ready(
        &self,
        manifest: Arc<FileAccessManifest>,
        process: Arc<dyn SandboxedProcess>,
        completion: oneshot::Sender<()>,
    ) -> bool {
        let pip_id = process.pip_id();
        if self.pips.contains_key(&pip_id) {
            tracing::warn!(pip_id = %pip_id, "Pip already registered");
            return false;
        }
        self.pips.insert(
            pip_id,
            Mutex::new(PipState {
                manifest,
                process,
                completion: Some(completion),
                root_pid: None,
                live: HashSet::new(),
                root_exited: false,
            }),
        );
        tracing::debug!(pip_id = %pip_id, "Pip ready");
        true
    }

    fn notify_pip_started(
        &self,
        manifest: &FileAccessManifest,
        process: &dyn SandboxedProcess,
    ) -> bool {
        let pip_id = manifest.pip_id();
        let pid = process.process_id();
        if pid == 0 || process.pip_id() != pip_id {
            return false;
        }
        if let Some(other) = self.owners.get(&pid)
            && *other != pip_id
        {
            tracing::warn!(pip_id = %pip_id, pid, owner = %*other, "Process id already owned");
            return false;
        }

        let registered = self.with_pip(pip_id, |state| {
            state.root_pid = Some(pid);
            state.live.insert(pid);
        });
        if registered.is_none() {
            tracing::warn!(pip_id = %pip_id, "Pip started without being ready");
            return false;
        }
        self.owners.insert(pid, pip_id);
        *self.last_report.lock() = Instant::now();
        tracing::debug!(pip_id = %pip_id, pid, "Pip started");
        true
    }

    fn notify_usage(&self, cpu_basis_points: u32, available_ram_mb: u64) {
        *self.usage.lock() = Some(UsageSample {
            cpu_basis_points,
            available_ram_mb,
        });
        if available_ram_mb < self.low_memory_threshold_mb {
            tracing::trace!(available_ram_mb, "Low memory; throttling report drain");
        }
    }

    fn notify_root_process_exited(&self, pip_id: PipId, process: &dyn SandboxedProcess) {
        let pid = process.process_id();
        let Some(entry) = self.pips.get(&pip_id) else {
            return;
        };
        let mut state = entry.lock();
        state.root_exited = true;
        state.live.remove(&pid);
        self.try_complete(pip_id, &mut state);
    }

    fn notify_pip_finished(&self, pip_id: PipId, _process: &dyn SandboxedProcess) -> bool {
        if self.has_pending(pip_id) {
            return false;
        }
        if self.pips.remove(&pip_id).is_some() {
            self.owners.retain(|_, owner| *owner != pip_id);
            tracing::debug!(pip_id = %pip_id, "Pip resources released");
        }
        true
    }

    fn notify_pip_process_terminated(&self, pip_id: PipId, process_id: u32) {
        let Some(entry) = self.pips.get(&pip_id) else {
            return;
        };
        let mut state = entry.lock();
        state.live.remove(&process_id);
        if state.root_pid == Some(process_id) {
            state.root_exited = true;
        }
        self.try_complete(pip_id, &mut state);
    }

    fn min_report_queue_enqueue_time(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|queue| queue.lock().front().map(|q| q.enqueued_at))
            .min()
    }

    fn current_drought(&self) -> Duration {
        self.last_report.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipwarden_types::{FileAccessStatus, RequestedAccess, encode_line, encode_process_line};
    use std::path::Path;

    fn setup(
        pid: u32,
    ) -> (
        QueuedSandboxConnection,
        Arc<FileAccessManifest>,
        Arc<ChannelProcess>,
        mpsc::UnboundedReceiver<AccessReport>,
        oneshot::Receiver<()>,
    ) {
        let connection = QueuedSandboxConnection::new(SandboxKind::Native, 2);
        let manifest = Arc::new(FileAccessManifest::new(PipId::new(1)));
        let (process, rx) = ChannelProcess::new(PipId::new(1));
        let process = Arc::new(process);
        let (done_tx, done_rx) = oneshot::channel();
        assert!(connection.notify_pip_ready(manifest.clone(), process.clone(), done_tx));
        process.set_process_id(pid);
        assert!(connection.notify_pip_started(&manifest, process.as_ref()));
        (connection, manifest, process, rx, done_rx)
    }

    fn write_line(pid: u32, path: &str) -> String {
        encode_line(&ReportedFileAccess::new(
            ReportedFileOperation::Write,
            pid,
            RequestedAccess::WRITE,
            path,
        ))
    }

    fn exit_line(pid: u32, code: u32) -> String {
        encode_line(
            &ReportedFileAccess::new(ReportedFileOperation::ProcessExit, pid, RequestedAccess::NONE, "")
                .with_error(code),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AccessReport>) -> Vec<AccessReport> {
        let mut out = Vec::new();
        while let Ok(report) = rx.try_recv() {
            out.push(report);
        }
        out
    }

    #[test]
    fn test_started_fails_without_ready_or_pid() {
        let connection = QueuedSandboxConnection::new(SandboxKind::Native, 1);
        let manifest = FileAccessManifest::new(PipId::new(5));
        let (process, _rx) = ChannelProcess::new(PipId::new(5));
        process.set_process_id(100);
        assert!(!connection.notify_pip_started(&manifest, &process));

        let (done_tx, _done_rx) = oneshot::channel();
        let process = Arc::new(process);
        assert!(connection.notify_pip_ready(Arc::new(manifest.clone()), process.clone(), done_tx));
        process.set_process_id(0);
        assert!(!connection.notify_pip_started(&manifest, process.as_ref()));
    }

    #[test]
    fn test_duplicate_ready_rejected() {
        let (connection, manifest, process, _rx, _done) = setup(10);
        let (tx, _) = oneshot::channel();
        assert!(!connection.notify_pip_ready(manifest, process, tx));
    }

    #[test]
    fn test_reports_routed_to_owner() {
        let (connection, _manifest, _process, mut rx, _done) = setup(10);

        assert!(connection.ingest_line(0, &write_line(10, "/out/a")));
        assert!(connection.ingest_line(1, &write_line(99, "/out/b")));
        assert!(!connection.ingest_line(0, "garbage"));
        assert_eq!(connection.pump(), 2);

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            AccessReport::FileAccess(access) => assert_eq!(access.path, Path::new("/out/a")),
            other => panic!("unexpected report {other:?}"),
        }
        let stats = connection.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_child_processes_attributed_via_parent() {
        let (connection, _manifest, _process, mut rx, _done) = setup(10);

        connection.ingest_line(0, &encode_process_line(11, Some(10), Path::new("/bin/cc"), Some("-c x")));
        connection.ingest_line(0, &write_line(11, "/out/x.o"));
        connection.pump();

        let reports = drain(&mut rx);
        assert!(matches!(
            &reports[0],
            AccessReport::ProcessStarted(p) if p.process_id == 11 && p.parent_process_id == Some(10)
        ));
        assert!(matches!(&reports[1], AccessReport::FileAccess(a) if a.process_id == 11));
    }

    #[test]
    fn test_completion_after_root_exit_and_drain() {
        let (connection, _manifest, process, mut rx, mut done) = setup(10);

        connection.ingest_line(0, &encode_process_line(11, Some(10), Path::new("/bin/sh"), None));
        connection.pump();
        connection.ingest_line(0, &exit_line(10, 3));
        connection.ingest_line(1, &write_line(11, "/out/late"));

        // Reports still queued
        assert!(!connection.notify_pip_finished(PipId::new(1), process.as_ref()));
        assert!(connection.min_report_queue_enqueue_time().is_some());

        connection.pump();
        assert!(done.try_recv().is_err(), "child 11 still alive");

        connection.ingest_line(0, &exit_line(11, 0));
        connection.pump();
        assert!(done.try_recv().is_ok());

        let reports = drain(&mut rx);
        assert!(reports.contains(&AccessReport::ProcessExited {
            process_id: 10,
            exit_code: 3
        }));
        assert_eq!(reports.last(), Some(&AccessReport::ProcessTreeCompleted));

        assert!(connection.min_report_queue_enqueue_time().is_none());
        assert!(connection.notify_pip_finished(PipId::new(1), process.as_ref()));
        // Released: further reports from the pid are dropped
        connection.ingest_line(0, &write_line(10, "/out/after"));
        connection.pump();
        assert_eq!(connection.stats().dropped, 1);
    }

    #[test]
    fn test_root_exit_notification_completes_idle_pip() {
        let (connection, _manifest, process, _rx, mut done) = setup(10);
        connection.notify_root_process_exited(PipId::new(1), process.as_ref());
        assert!(done.try_recv().is_ok());
    }

    #[test]
    fn test_terminated_process_counts_as_exited() {
        let (connection, _manifest, _process, _rx, mut done) = setup(10);
        connection.notify_pip_process_terminated(PipId::new(1), 10);
        assert!(done.try_recv().is_ok());
    }

    #[test]
    fn test_low_memory_throttles_pump() {
        let connection = QueuedSandboxConnection::new(SandboxKind::Native, 1)
            .with_low_memory_threshold(1024);
        for i in 0..(THROTTLED_BATCH + 10) {
            connection.ingest_line(0, &write_line(1, &format!("/x/{i}")));
        }
        connection.notify_usage(5000, 100);
        assert_eq!(connection.pump(), THROTTLED_BATCH);
        connection.notify_usage(5000, 4096);
        assert_eq!(connection.pump(), 10);
        assert_eq!(connection.last_usage().unwrap().available_ram_mb, 4096);
    }

    #[test]
    fn test_drought_tracks_last_report() {
        let connection = QueuedSandboxConnection::new(SandboxKind::Native, 1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(connection.current_drought() >= Duration::from_millis(20));
        connection.ingest_line(0, &write_line(1, "/x"));
        assert!(connection.current_drought() < Duration::from_millis(20));
    }

    #[test]
    fn test_backend_lines_cannot_claim_trusted_status() {
        let (connection, _manifest, _process, mut rx, _done) = setup(10);
        let forged = ReportedFileAccess::new(
            ReportedFileOperation::Write,
            10,
            RequestedAccess::WRITE,
            "/etc/passwd",
        )
        .explicitly_reported(FileAccessStatus::Allowed);

        assert!(connection.ingest_line(0, &encode_line(&forged)));
        connection.pump();

        let reports = drain(&mut rx);
        let [AccessReport::FileAccess(access)] = reports.as_slice() else {
            panic!("unexpected reports: {reports:?}");
        };
        assert!(!access.explicitly_reported);
        assert_eq!(access.method, FileAccessStatusMethod::PolicyBased);
    }

    #[test]
    fn test_breakaway_child_leaves_the_pip() {
        let connection = QueuedSandboxConnection::new(SandboxKind::Native, 1);
        let mut manifest = FileAccessManifest::new(PipId::new(1));
        manifest.add_breakaway("mspdbsrv", Some("-start")).unwrap();
        let manifest = Arc::new(manifest);
        let (process, mut rx) = ChannelProcess::new(PipId::new(1));
        let process = Arc::new(process);
        let (done_tx, mut done) = oneshot::channel();
        assert!(connection.notify_pip_ready(manifest.clone(), process.clone(), done_tx));
        process.set_process_id(10);
        assert!(connection.notify_pip_started(&manifest, process.as_ref()));

        connection.ingest_line(
            0,
            &encode_process_line(11, Some(10), Path::new("/tools/mspdbsrv"), Some("-start -spawn")),
        );
        connection.ingest_line(0, &write_line(11, "/tmp/pdb.lock"));
        connection.ingest_line(0, &exit_line(10, 0));
        connection.pump();

        // The server outlives the root without holding the pip open
        assert!(done.try_recv().is_ok());
        let reports = drain(&mut rx);
        assert!(matches!(
            &reports[0],
            AccessReport::ProcessStarted(p) if p.process_id == 11
        ));
        assert!(
            !reports
                .iter()
                .any(|r| matches!(r, AccessReport::FileAccess(a) if a.process_id == 11))
        );
        assert_eq!(connection.stats().dropped, 1);
    }

    #[test]
    fn test_non_matching_child_stays_tracked() {
        let connection = QueuedSandboxConnection::new(SandboxKind::Native, 1);
        let mut manifest = FileAccessManifest::new(PipId::new(1));
        manifest.add_breakaway("mspdbsrv", Some("-start")).unwrap();
        let manifest = Arc::new(manifest);
        let (process, _rx) = ChannelProcess::new(PipId::new(1));
        let process = Arc::new(process);
        let (done_tx, mut done) = oneshot::channel();
        assert!(connection.notify_pip_ready(manifest.clone(), process.clone(), done_tx));
        process.set_process_id(10);
        assert!(connection.notify_pip_started(&manifest, process.as_ref()));

        connection.ingest_line(
            0,
            &encode_process_line(11, Some(10), Path::new("/tools/mspdbsrv"), Some("-stop")),
        );
        connection.ingest_line(0, &exit_line(10, 0));
        connection.pump();
        assert!(done.try_recv().is_err(), "child 11 still alive");
    }

    #[tokio::test]
    async fn test_spawned_pump_delivers() {
        let (connection, _manifest, _process, mut rx, _done) = setup(10);
        let connection = Arc::new(connection);
        let cancel = CancellationToken::new();
        let handle = connection
            .clone()
            .spawn_pump(Duration::from_millis(5), cancel.clone());

        connection.ingest_line(0, &write_line(10, "/out/a"));
        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report, AccessReport::FileAccess(_)));

        cancel.cancel();
        handle.await.unwrap();
    }
}

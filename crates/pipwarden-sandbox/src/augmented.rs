//! Direct reporting channel for trusted breakaway tools.
//!
//! A trusted tool that escapes interception reports its accesses itself by
//! writing report lines to a channel the engine prepared. The channel is
//! named by [`AUGMENTED_CHANNEL_ENV`]; a process started without it simply
//! has no channel, and every report call returns `false`.
//!
//! A failed write is fatal to the reporting process: it must not continue
//! believing the engine saw an access that was never delivered.
//!
//! The engine end is [`AugmentedChannel`]: one file per pip, created before
//! launch and tailed while the tool runs. Only accesses read back from it
//! carry a trusted status.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use pipwarden_types::{
    FileAccessStatus, PipId, ReportedFileAccess, ReportedFileOperation, RequestedAccess,
    encode_line, parse_line,
};

use crate::error::SandboxResult;

/// Environment variable naming the channel file.
pub const AUGMENTED_CHANNEL_ENV: &str = "PIPWARDEN_AUGMENTED_REPORT_CHANNEL";

/// Exit code used when a report cannot be delivered.
pub const FATAL_EXIT_CODE: i32 = 70;

type FatalHandler = Box<dyn Fn(&io::Error) + Send + Sync>;

/// Reporter bound to one channel for the lifetime of the process.
///
/// Construct once at tool start-up and pass it to whatever reports accesses.
pub struct AugmentedManifestReporter {
    channel: Option<Mutex<File>>,
    channel_path: Option<PathBuf>,
    on_fatal: FatalHandler,
}

impl std::fmt::Debug for AugmentedManifestReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AugmentedManifestReporter")
            .field("channel", &self.channel_path)
            .finish()
    }
}

impl AugmentedManifestReporter {
    /// Initialize from [`AUGMENTED_CHANNEL_ENV`].
    pub fn from_env() -> Self {
        Self::initialize(std::env::var(AUGMENTED_CHANNEL_ENV).ok())
    }

    /// Initialize from an explicit channel reference.
    ///
    /// A missing, empty or unopenable channel leaves the reporter disabled.
    pub fn initialize(channel: Option<String>) -> Self {
        let channel_path = channel.filter(|c| !c.is_empty()).map(PathBuf::from);
        let channel = channel_path.as_deref().and_then(|path| {
            match OpenOptions::new().append(true).open(path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    tracing::warn!(channel = %path.display(), error = %e, "Cannot open augmented report channel");
                    None
                }
            }
        });

        Self {
            channel,
            channel_path,
            on_fatal: Box::new(default_fatal),
        }
    }

    /// Replace the fatal-write handler.
    pub fn with_fatal_handler(mut self, handler: impl Fn(&io::Error) + Send + Sync + 'static) -> Self {
        self.on_fatal = Box::new(handler);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel_path(&self) -> Option<&Path> {
        self.channel_path.as_deref()
    }

    /// Report one access as seen by this process.
    pub fn try_report_file_access(&self, access: &ReportedFileAccess) -> bool {
        self.write_lines(std::slice::from_ref(access))
    }

    /// Report that this process created (wrote) each of `paths`.
    pub fn try_report_file_creations<P: AsRef<Path>>(&self, paths: &[P]) -> bool {
        self.report_batch(paths, ReportedFileOperation::Write, RequestedAccess::WRITE)
    }

    /// Report that this process read each of `paths`.
    pub fn try_report_file_reads<P: AsRef<Path>>(&self, paths: &[P]) -> bool {
        self.report_batch(paths, ReportedFileOperation::Read, RequestedAccess::READ)
    }

    fn report_batch<P: AsRef<Path>>(
        &self,
        paths: &[P],
        operation: ReportedFileOperation,
        requested: RequestedAccess,
    ) -> bool {
        if self.channel.is_none() {
            return false;
        }
        let pid = std::process::id();
        let accesses: Vec<ReportedFileAccess> = paths
            .iter()
            .map(|p| {
                ReportedFileAccess::new(operation, pid, requested, p.as_ref())
                    .explicitly_reported(FileAccessStatus::Allowed)
            })
            .collect();
        self.write_lines(&accesses)
    }

    fn write_lines(&self, accesses: &[ReportedFileAccess]) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };

        let mut payload = String::new();
        for access in accesses {
            let access = if access.explicitly_reported {
                access.clone()
            } else {
                access.clone().explicitly_reported(access.status)
            };
            payload.push_str(&encode_line(&access));
            payload.push('\n');
        }

        let mut file = channel.lock();
        let result = file
            .write_all(payload.as_bytes())
            .and_then(|()| file.flush());
        match result {
            Ok(()) => true,
            Err(e) => {
                (self.on_fatal)(&e);
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine side
// ─────────────────────────────────────────────────────────────────────────────

/// The engine end of one pip's channel.
#[derive(Debug)]
pub struct AugmentedChannel {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    rejected: u64,
}

impl AugmentedChannel {
    /// Create an empty channel file for `pip_id` under `dir`.
    pub fn create(dir: &Path, pip_id: PipId) -> SandboxResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{pip_id}-{}.augmented", std::process::id()));
        File::create(&path)?;
        Ok(Self {
            path,
            offset: 0,
            partial: Vec::new(),
            rejected: 0,
        })
    }

    /// Value for [`AUGMENTED_CHANNEL_ENV`] in the tool's environment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines that failed to decode or tried to report process lifecycle.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Read every complete line appended since the last call.
    ///
    /// A trailing line without its newline is kept for the next call.
    pub fn read_new(&mut self) -> io::Result<Vec<ReportedFileAccess>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf)?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&buf);

        let Some(end) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete: Vec<u8> = self.partial.drain(..=end).collect();

        let mut accesses = Vec::new();
        for line in String::from_utf8_lossy(&complete).lines() {
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(parsed) if parsed.access.operation.is_process_event() => {
                    self.rejected += 1;
                    tracing::debug!(line, "Process report on augmented channel ignored");
                }
                Ok(parsed) => {
                    let status = parsed.access.status;
                    accesses.push(parsed.access.explicitly_reported(status));
                }
                Err(e) => {
                    self.rejected += 1;
                    tracing::debug!(error = %e, line, "Dropping malformed augmented report");
                }
            }
        }
        Ok(accesses)
    }

    /// Delete the channel file.
    pub fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(channel = %self.path.display(), error = %e, "Could not remove augmented channel");
        }
    }
}

fn default_fatal(error: &io::Error) {
    tracing::error!(error = %error, "Augmented access report could not be delivered; exiting");
    std::process::exit(FATAL_EXIT_CODE);
}

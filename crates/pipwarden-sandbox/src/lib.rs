//! File-access sandbox engine.
//!
//! This crate decides, for every file access a sandboxed tool makes, whether
//! the access was allowed by the tool's manifest and whether it must be
//! reported. The interception itself happens in a platform backend; what
//! arrives here is a stream of report lines.
//!
//! # Pipeline
//!
//! 1. Build a [`FileAccessManifest`] from declared inputs and outputs and
//!    [`encode`](FileAccessManifest::encode) it for the backend
//! 2. Register the pip with a [`SandboxConnection`]; decoded reports are
//!    routed to its [`SandboxedProcess`]
//! 3. Feed each [`AccessReport`] to an [`AccessReportProcessor`], which
//!    translates, resolves symlinks, classifies and journals
//! 4. [`AccessReportProcessor::finish`] yields the [`ObservedAccesses`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pipwarden_sandbox::{
//!     AccessReportProcessor, FileAccessManifest, FileSystemView, RealFileSystem,
//! };
//! use pipwarden_types::{FileAccessPolicy, PipId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut manifest = FileAccessManifest::new(PipId::new(1));
//! manifest.add_scope("/work/src", FileAccessPolicy::ALLOW_READ_ONLY)?;
//! manifest.add_scope("/work/out", FileAccessPolicy::ALLOW_ALL)?;
//! let bytes = manifest.encode()?;
//!
//! let fs: Arc<dyn FileSystemView> = Arc::new(RealFileSystem);
//! let processor = AccessReportProcessor::new(Arc::new(manifest), fs, "/usr/bin/cc");
//! let observed = processor.finish();
//! println!("{} bytes, {} unexpected", bytes.len(), observed.unexpected.len());
//! # Ok(())
//! # }
//! ```

pub mod allowlist;
pub mod augmented;
pub mod classify;
pub mod connection;
mod error;
pub mod fs;
pub mod jail;
pub mod journal;
pub mod manifest;
pub mod paths;
pub mod reports;
pub mod symlinks;
pub mod translator;

pub use allowlist::{AllowlistEntry, AllowlistMatch, FileAccessAllowlist, ToolIdentity};
pub use augmented::{AUGMENTED_CHANNEL_ENV, AugmentedChannel, AugmentedManifestReporter};
pub use classify::{AccessClassifier, Classified};
pub use connection::{
    AccessReport, ChannelProcess, ConnectionStats, QueuedSandboxConnection, SandboxConnection,
    SandboxedProcess, UsageSample,
};
pub use error::{SandboxError, SandboxResult};
pub use fs::{FileSystemView, InMemoryFileSystem, RealFileSystem};
pub use jail::RootJailInfo;
pub use journal::{JournalFault, SharedOpaqueJournal, journal_path_for, read_journal};
pub use manifest::{BreakawayChildProcess, FileAccessManifest, PolicyLookup};
pub use reports::{AccessReportProcessor, ObservedAccesses};
pub use symlinks::{Resolution, SymlinkedAccessResolver};
pub use translator::DirectoryTranslator;

//! Per-invocation processing of decoded access reports.
//!
//! Each file access goes through, in order: directory translation, symlink
//! resolution (which may add probe accesses for intermediate links),
//! classification, allowlist reclassification of denied accesses, and
//! journaling of allowed writes under shared opaque roots. The result is an
//! [`ObservedAccesses`] set keyed by `(operation, manifest path)`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use pipwarden_types::{
    AccessKey, FileAccessStatus, ManifestFlags, ReportedFileAccess, ReportedProcess,
};

use crate::allowlist::AllowlistMatch;
use crate::classify::AccessClassifier;
use crate::connection::AccessReport;
use crate::fs::FileSystemView;
use crate::journal::{JournalFault, SharedOpaqueJournal};
use crate::manifest::FileAccessManifest;
use crate::symlinks::SymlinkedAccessResolver;

/// Everything observed for one invocation.
#[derive(Debug, Clone, Default)]
pub struct ObservedAccesses {
    /// Reported accesses, deduplicated.
    pub accesses: BTreeMap<AccessKey, ReportedFileAccess>,
    /// Denied accesses no allowlist entry tolerated.
    pub unexpected: Vec<ReportedFileAccess>,
    /// Denied accesses an allowlist entry tolerated.
    pub allowlisted: Vec<ReportedFileAccess>,
    pub processes: Vec<ReportedProcess>,
    /// False once an allowlist match forbids caching or an unexpected access
    /// was seen.
    pub cacheable: bool,
    pub journal_fault: Option<JournalFault>,
}

impl ObservedAccesses {
    pub fn file_accesses(&self) -> Vec<ReportedFileAccess> {
        self.accesses.values().cloned().collect()
    }

    pub fn has_unexpected(&self) -> bool {
        !self.unexpected.is_empty()
    }
}

/// Consumes [`AccessReport`]s for one pip.
pub struct AccessReportProcessor {
    manifest: Arc<FileAccessManifest>,
    fs: Arc<dyn FileSystemView>,
    resolver: Option<Arc<SymlinkedAccessResolver>>,
    journal: Option<SharedOpaqueJournal>,
    root_tool: PathBuf,
    tools: HashMap<u32, PathBuf>,
    probes_seen: HashSet<PathBuf>,
    observed: ObservedAccesses,
}

impl AccessReportProcessor {
    /// `root_tool` identifies processes the backend never announced.
    pub fn new(
        manifest: Arc<FileAccessManifest>,
        fs: Arc<dyn FileSystemView>,
        root_tool: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manifest,
            fs,
            resolver: None,
            journal: None,
            root_tool: root_tool.into(),
            tools: HashMap::new(),
            probes_seen: HashSet::new(),
            observed: ObservedAccesses {
                cacheable: true,
                ..Default::default()
            },
        }
    }

    /// Use a shared resolver; ignored unless the manifest enables symlink
    /// resolution.
    pub fn with_resolver(mut self, resolver: Arc<SymlinkedAccessResolver>) -> Self {
        if self.manifest.has_flag(ManifestFlags::RESOLVE_SYMLINKS) {
            self.resolver = Some(resolver);
        }
        self
    }

    pub fn with_journal(mut self, journal: SharedOpaqueJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn process(&mut self, report: AccessReport) {
        match report {
            AccessReport::ProcessStarted(process) => {
                self.tools.insert(process.process_id, process.path.clone());
                self.observed.processes.push(process);
            }
            AccessReport::ProcessExited {
                process_id,
                exit_code,
            } => {
                if let Some(process) = self
                    .observed
                    .processes
                    .iter_mut()
                    .rev()
                    .find(|p| p.process_id == process_id)
                {
                    process.exit_code = Some(exit_code);
                }
            }
            AccessReport::ProcessTreeCompleted => {}
            AccessReport::FileAccess(access) => self.process_access(access),
        }
    }

    fn process_access(&mut self, access: ReportedFileAccess) {
        let translated = self.manifest.translator().translate(access.effective_path());
        let mut access = access.with_manifest_path(translated);

        let mut probes = Vec::new();
        if let Some(resolver) = &self.resolver {
            probes = resolver.synthesize_probes_for_symlink_chain(&access, &mut self.probes_seen);
            access = resolver.resolve_access(access);
        }

        for probe in probes {
            self.record(probe);
        }
        self.record(access);
    }

    fn record(&mut self, access: ReportedFileAccess) {
        let classified = AccessClassifier::new(&self.manifest, self.fs.as_ref()).classify(access);
        let mut access = classified.access;
        let mut report = classified.should_report
            || self.manifest.has_flag(ManifestFlags::REPORT_FILE_ACCESSES);

        if access.is_denied() && !access.explicitly_reported {
            let tool = self
                .tools
                .get(&access.process_id)
                .unwrap_or(&self.root_tool);
            match self.manifest.allowlist().matches(&access, tool) {
                AllowlistMatch::NoMatch => {
                    tracing::debug!(
                        pip_id = %self.manifest.pip_id(),
                        path = %access.path.display(),
                        operation = %access.operation,
                        "Unexpected file access"
                    );
                    self.observed.cacheable = false;
                    self.observed.unexpected.push(access.clone());
                    report |= self.manifest.has_flag(ManifestFlags::REPORT_UNEXPECTED_ACCESSES);
                }
                matched => {
                    if matched == AllowlistMatch::MatchesButNotCaching {
                        self.observed.cacheable = false;
                    }
                    let method = access.method;
                    access = access.with_status(FileAccessStatus::Allowed, method);
                    self.observed.allowlisted.push(access.clone());
                    report = true;
                }
            }
        }

        if access.status == FileAccessStatus::Allowed
            && access.is_write()
            && let Some(journal) = self.journal.as_mut()
        {
            journal.record_write(access.effective_path());
        }

        if report || access.explicitly_reported {
            self.insert(access);
        }
    }

    /// Keep the first access per key, unless a later one is denied.
    fn insert(&mut self, access: ReportedFileAccess) {
        use std::collections::btree_map::Entry;
        match self.observed.accesses.entry(access.key()) {
            Entry::Vacant(slot) => {
                slot.insert(access);
            }
            Entry::Occupied(mut slot) => {
                if access.is_denied() && !slot.get().is_denied() {
                    slot.insert(access);
                }
            }
        }
    }

    pub fn observed(&self) -> &ObservedAccesses {
        &self.observed
    }

    /// Close the journal and return the observations.
    pub fn finish(mut self) -> ObservedAccesses {
        if let Some(journal) = self.journal.take() {
            self.observed.journal_fault = journal.fault().cloned();
        }
        self.observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::{AllowlistEntry, FileAccessAllowlist, ToolIdentity};
    use crate::fs::InMemoryFileSystem;
    use crate::journal::read_journal;
    use pipwarden_types::{
        FileAccessPolicy, FileAccessStatusMethod, PipId, ReportedFileOperation, RequestedAccess,
    };
    use std::path::Path;

    fn manifest() -> FileAccessManifest {
        let mut manifest = FileAccessManifest::new(PipId::new(3));
        manifest.add_scope("/out", FileAccessPolicy::ALLOW_ALL).unwrap();
        manifest
            .add_scope("/real", FileAccessPolicy::ALLOW_READ_ONLY)
            .unwrap();
        manifest
            .add_scope("/src", FileAccessPolicy::ALLOW_READ_ONLY)
            .unwrap();
        manifest
    }

    fn processor(manifest: FileAccessManifest, fs: InMemoryFileSystem) -> AccessReportProcessor {
        let fs: Arc<dyn FileSystemView> = Arc::new(fs);
        let resolver = Arc::new(SymlinkedAccessResolver::new(fs.clone()));
        AccessReportProcessor::new(Arc::new(manifest), fs, "/usr/bin/tool").with_resolver(resolver)
    }

    fn access(op: ReportedFileOperation, requested: RequestedAccess, path: &str) -> AccessReport {
        AccessReport::FileAccess(ReportedFileAccess::new(op, 20, requested, path))
    }

    #[test]
    fn test_unexpected_write_recorded() {
        let mut processor = processor(manifest(), InMemoryFileSystem::new());
        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/src/a.c"));
        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/out/a.o"));

        let observed = processor.finish();
        assert_eq!(observed.unexpected.len(), 1);
        assert_eq!(observed.unexpected[0].path, PathBuf::from("/src/a.c"));
        assert!(!observed.cacheable);
        // Allowed, unreported accesses are not kept
        assert_eq!(observed.accesses.len(), 1);
    }

    #[test]
    fn test_symlinked_read_gets_probe_and_manifest_path() {
        let fs = InMemoryFileSystem::new();
        fs.add("/real/file.txt").add_link("/out/link", "/real");
        let mut manifest = manifest();
        manifest
            .set_flags(manifest.flags() | ManifestFlags::REPORT_FILE_ACCESSES)
            .unwrap();
        let mut processor = processor(manifest, fs);

        processor.process(access(
            ReportedFileOperation::Read,
            RequestedAccess::READ,
            "/out/link/file.txt",
        ));
        let observed = processor.finish();

        let read = observed
            .accesses
            .values()
            .find(|a| a.operation == ReportedFileOperation::Read)
            .unwrap();
        assert_eq!(read.effective_path(), Path::new("/real/file.txt"));
        assert_eq!(read.status, FileAccessStatus::Allowed);

        let probe = observed
            .accesses
            .get(&AccessKey {
                operation: ReportedFileOperation::Probe,
                path: PathBuf::from("/out/link"),
            })
            .unwrap();
        assert_eq!(probe.status, FileAccessStatus::Allowed);
        assert!(observed.cacheable);
    }

    #[test]
    fn test_allowlist_tolerates_denied_access() {
        let mut manifest = manifest();
        manifest
            .set_allowlist(FileAccessAllowlist::new(vec![
                AllowlistEntry::new(
                    "tool-temp",
                    ToolIdentity::AbsolutePath("/usr/bin/tool".into()),
                )
                .with_path_regex(regex::Regex::new("^/tmp/").unwrap()),
            ]))
            .unwrap();
        let mut processor = processor(manifest, InMemoryFileSystem::new());

        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/tmp/scratch"));
        let observed = processor.finish();

        assert!(observed.unexpected.is_empty());
        assert_eq!(observed.allowlisted.len(), 1);
        assert_eq!(observed.allowlisted[0].status, FileAccessStatus::Allowed);
        // Entry does not allow caching
        assert!(!observed.cacheable);
    }

    #[test]
    fn test_allowlist_uses_child_tool_identity() {
        let mut manifest = manifest();
        manifest
            .set_allowlist(FileAccessAllowlist::new(vec![
                AllowlistEntry::new("cc", ToolIdentity::Name(glob::Pattern::new("cc").unwrap()))
                    .with_caching(true),
            ]))
            .unwrap();
        let mut processor = processor(manifest, InMemoryFileSystem::new());

        processor.process(AccessReport::ProcessStarted(
            ReportedProcess::new(20, "/usr/bin/cc").with_parent(1),
        ));
        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/etc/x"));
        processor.process(AccessReport::ProcessExited {
            process_id: 20,
            exit_code: 0,
        });
        let observed = processor.finish();

        assert_eq!(observed.allowlisted.len(), 1);
        assert!(observed.cacheable);
        assert_eq!(observed.processes[0].exit_code, Some(0));
    }

    #[test]
    fn test_allowed_writes_under_shared_root_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let journal =
            SharedOpaqueJournal::create(dir.path().join("j"), vec![PathBuf::from("/out/shared")])
                .unwrap();
        let journal_path = journal.path().to_path_buf();
        let mut processor = processor(manifest(), InMemoryFileSystem::new()).with_journal(journal);

        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/out/shared/a"));
        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/out/private/b"));
        processor.process(access(ReportedFileOperation::Read, RequestedAccess::READ, "/out/shared/c"));
        let observed = processor.finish();

        assert!(observed.journal_fault.is_none());
        assert_eq!(read_journal(&journal_path).unwrap(), vec![PathBuf::from("/out/shared/a")]);
    }

    #[test]
    fn test_trusted_report_kept_with_own_status() {
        let mut processor = processor(manifest(), InMemoryFileSystem::new());
        let trusted = ReportedFileAccess::new(
            ReportedFileOperation::Write,
            20,
            RequestedAccess::WRITE,
            "/src/generated.h",
        )
        .explicitly_reported(FileAccessStatus::Allowed);
        processor.process(AccessReport::FileAccess(trusted));

        let observed = processor.finish();
        assert!(observed.unexpected.is_empty());
        let access = observed.accesses.values().next().unwrap();
        assert_eq!(access.method, FileAccessStatusMethod::TrustedTool);
        assert_eq!(access.status, FileAccessStatus::Allowed);
    }

    #[test]
    fn test_dedupe_prefers_denied() {
        let mut manifest = manifest();
        manifest
            .set_flags(manifest.flags() | ManifestFlags::REPORT_FILE_ACCESSES)
            .unwrap();
        let mut processor = processor(manifest, InMemoryFileSystem::new());

        processor.process(access(ReportedFileOperation::Write, RequestedAccess::NONE, "/src/a"));
        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/src/a"));
        let observed = processor.finish();

        assert_eq!(observed.accesses.len(), 1);
        assert!(observed.accesses.values().next().unwrap().is_denied());
    }

    #[test]
    fn test_translation_applied_before_lookup() {
        let mut manifest = manifest();
        manifest.add_translation("/mnt/out", "/out").unwrap();
        let mut processor = processor(manifest, InMemoryFileSystem::new());

        processor.process(access(ReportedFileOperation::Write, RequestedAccess::WRITE, "/mnt/out/x"));
        let observed = processor.finish();
        assert!(observed.unexpected.is_empty());
    }
}

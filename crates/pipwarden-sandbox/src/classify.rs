//! Access classification against a manifest.
//!
//! Precedence:
//! 1. an explicit report from a trusted tool keeps its own status
//! 2. with `OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES`, a write to an existing
//!    file is decided by existence
//! 3. otherwise the manifest policy bits decide

use std::path::Path;

use pipwarden_types::{
    FileAccessPolicy, FileAccessStatus, FileAccessStatusMethod, ReportedFileAccess,
};

use crate::fs::FileSystemView;
use crate::manifest::{FileAccessManifest, PolicyLookup};

/// A classified access plus what the policy says about reporting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub access: ReportedFileAccess,
    /// Policy that applied; `None` for trusted-tool reports, process events
    /// and undeterminable paths.
    pub lookup: Option<PolicyLookup>,
    /// The policy's report flags ask for this access to be reported.
    pub should_report: bool,
}

/// Classifies accesses for one manifest.
pub struct AccessClassifier<'a> {
    manifest: &'a FileAccessManifest,
    fs: &'a dyn FileSystemView,
}

impl<'a> AccessClassifier<'a> {
    pub fn new(manifest: &'a FileAccessManifest, fs: &'a dyn FileSystemView) -> Self {
        Self { manifest, fs }
    }

    pub fn classify(&self, access: ReportedFileAccess) -> Classified {
        if access.explicitly_reported {
            let status = access.status;
            let access = access.with_status(status, FileAccessStatusMethod::TrustedTool);
            return Classified {
                access,
                lookup: None,
                should_report: true,
            };
        }

        if access.operation.is_process_event() {
            return Classified {
                access: access.with_status(FileAccessStatus::Allowed, FileAccessStatusMethod::PolicyBased),
                lookup: None,
                should_report: false,
            };
        }

        let path = access.effective_path().to_path_buf();
        if path.as_os_str().is_empty() || !path.is_absolute() {
            tracing::debug!(path = %path.display(), "Cannot determine policy for path");
            return Classified {
                access: access.with_status(
                    FileAccessStatus::CannotDeterminePolicy,
                    FileAccessStatusMethod::PolicyBased,
                ),
                lookup: None,
                should_report: true,
            };
        }

        let lookup = self.manifest.find_policy_for(&path);
        let policy = lookup.policy;
        let mut exists = None;

        let (status, method) = if access.is_write() && policy.overrides_writes_for_existing_files() {
            let present = self.exists(&path, &mut exists);
            if present {
                (FileAccessStatus::Denied, FileAccessStatusMethod::FileExistenceBased)
            } else {
                (
                    self.policy_status(&access, policy, &path, &mut exists),
                    FileAccessStatusMethod::PolicyBased,
                )
            }
        } else {
            (
                self.policy_status(&access, policy, &path, &mut exists),
                FileAccessStatusMethod::PolicyBased,
            )
        };

        let should_report = if policy.intersects(FileAccessPolicy::REPORT_ACCESS) {
            let present = self.exists(&path, &mut exists);
            policy.should_report(Some(present))
        } else {
            false
        };

        Classified {
            access: access.with_status(status, method),
            lookup: Some(lookup),
            should_report,
        }
    }

    fn policy_status(
        &self,
        access: &ReportedFileAccess,
        policy: FileAccessPolicy,
        path: &Path,
        exists: &mut Option<bool>,
    ) -> FileAccessStatus {
        // Existence only matters for the read-if-nonexistent allowance.
        let existence = if policy.contains(FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT) {
            Some(self.exists(path, exists))
        } else {
            None
        };
        if policy.permits(access.requested_access, existence) {
            FileAccessStatus::Allowed
        } else {
            FileAccessStatus::Denied
        }
    }

    fn exists(&self, path: &Path, cached: &mut Option<bool>) -> bool {
        *cached.get_or_insert_with(|| self.fs.exists(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use pipwarden_types::{PipId, ReportedFileOperation, RequestedAccess};

    fn manifest() -> FileAccessManifest {
        let mut manifest = FileAccessManifest::new(PipId::new(1));
        manifest.add_scope("/out", FileAccessPolicy::ALLOW_ALL).unwrap();
        manifest
            .add_scope("/src", FileAccessPolicy::ALLOW_READ_ONLY)
            .unwrap();
        manifest
            .add_scope(
                "/shared",
                FileAccessPolicy::ALLOW_ALL | FileAccessPolicy::OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES,
            )
            .unwrap();
        manifest
            .add_scope(
                "/probe",
                FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT | FileAccessPolicy::REPORT_ACCESS_IF_NONEXISTENT,
            )
            .unwrap();
        manifest
    }

    fn write(path: &str) -> ReportedFileAccess {
        ReportedFileAccess::new(ReportedFileOperation::Write, 1, RequestedAccess::WRITE, path)
    }

    #[test]
    fn test_write_under_output_allowed_by_policy() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        let classifier = AccessClassifier::new(&manifest, &fs);

        let result = classifier.classify(write("/out/sub/file.txt"));
        assert_eq!(result.access.status, FileAccessStatus::Allowed);
        assert_eq!(result.access.method, FileAccessStatusMethod::PolicyBased);
        assert_eq!(
            result.lookup.unwrap().matched,
            Some(std::path::PathBuf::from("/out"))
        );
    }

    #[test]
    fn test_write_to_input_denied() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        let classifier = AccessClassifier::new(&manifest, &fs);

        let result = classifier.classify(write("/src/a.c"));
        assert_eq!(result.access.status, FileAccessStatus::Denied);
        assert_eq!(result.access.method, FileAccessStatusMethod::PolicyBased);

        let outside = classifier.classify(write("/etc/hosts"));
        assert!(outside.access.is_denied());
        assert!(outside.should_report);
    }

    #[test]
    fn test_override_uses_existence() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        fs.add("/shared/existing.txt");
        let classifier = AccessClassifier::new(&manifest, &fs);

        let existing = classifier.classify(write("/shared/existing.txt"));
        assert_eq!(existing.access.status, FileAccessStatus::Denied);
        assert_eq!(existing.access.method, FileAccessStatusMethod::FileExistenceBased);

        let fresh = classifier.classify(write("/shared/new.txt"));
        assert_eq!(fresh.access.status, FileAccessStatus::Allowed);
        assert_eq!(fresh.access.method, FileAccessStatusMethod::PolicyBased);
    }

    #[test]
    fn test_trusted_tool_status_wins() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        fs.add("/shared/existing.txt");
        let classifier = AccessClassifier::new(&manifest, &fs);

        let access = write("/shared/existing.txt").explicitly_reported(FileAccessStatus::Allowed);
        let result = classifier.classify(access);
        assert_eq!(result.access.status, FileAccessStatus::Allowed);
        assert_eq!(result.access.method, FileAccessStatusMethod::TrustedTool);
    }

    #[test]
    fn test_relative_path_cannot_determine_policy() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        let classifier = AccessClassifier::new(&manifest, &fs);

        let result = classifier.classify(write("relative/x"));
        assert_eq!(result.access.status, FileAccessStatus::CannotDeterminePolicy);
        let empty = classifier.classify(write(""));
        assert_eq!(empty.access.status, FileAccessStatus::CannotDeterminePolicy);
    }

    #[test]
    fn test_read_if_nonexistent_and_reporting() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        fs.add("/probe/present");
        let classifier = AccessClassifier::new(&manifest, &fs);

        let read = |p: &str| {
            ReportedFileAccess::new(ReportedFileOperation::Probe, 1, RequestedAccess::PROBE, p)
        };

        let absent = classifier.classify(read("/probe/absent"));
        assert_eq!(absent.access.status, FileAccessStatus::Allowed);
        assert!(absent.should_report);

        let present = classifier.classify(read("/probe/present"));
        assert_eq!(present.access.status, FileAccessStatus::Denied);
        assert!(!present.should_report);
    }

    #[test]
    fn test_manifest_path_used_for_lookup() {
        let manifest = manifest();
        let fs = InMemoryFileSystem::new();
        let classifier = AccessClassifier::new(&manifest, &fs);

        let access = write("/link/file").with_manifest_path("/out/file");
        assert_eq!(
            classifier.classify(access).access.status,
            FileAccessStatus::Allowed
        );
    }
}

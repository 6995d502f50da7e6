//! The decoded access-report record and its classification enums.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReportLineError;
use crate::policy::RequestedAccess;

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! operations {
    ($($variant:ident = $code:literal),* $(,)?) => {
        /// The operation a report describes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ReportedFileOperation {
            $($variant),*
        }

        impl ReportedFileOperation {
            /// Every operation, in code order.
            pub const ALL: &'static [ReportedFileOperation] = &[$(ReportedFileOperation::$variant),*];

            /// Stable numeric code.
            pub fn code(self) -> u8 {
                match self {
                    $(ReportedFileOperation::$variant => $code),*
                }
            }

            /// Look an operation up by its numeric code.
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(ReportedFileOperation::$variant),)*
                    _ => None,
                }
            }

            /// Name used in the report-line format.
            pub fn name(self) -> &'static str {
                match self {
                    $(ReportedFileOperation::$variant => stringify!($variant)),*
                }
            }
        }

        impl FromStr for ReportedFileOperation {
            type Err = ReportLineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(ReportedFileOperation::$variant),)*
                    other => Err(ReportLineError::UnknownOperation(other.to_string())),
                }
            }
        }
    };
}

operations! {
    Unknown = 0,
    Process = 1,
    ProcessExit = 2,
    ProcessTreeCompleted = 3,
    Open = 4,
    Create = 5,
    Read = 6,
    Write = 7,
    Probe = 8,
    Enumerate = 9,
    CreateDirectory = 10,
    RemoveDirectory = 11,
    Unlink = 12,
    RenameSource = 13,
    RenameDestination = 14,
    CreateSymlink = 15,
    ReadLink = 16,
    Exec = 17,
    ChangeMode = 18,
}

impl ReportedFileOperation {
    /// Process lifecycle events rather than file accesses.
    pub fn is_process_event(self) -> bool {
        matches!(
            self,
            ReportedFileOperation::Process
                | ReportedFileOperation::ProcessExit
                | ReportedFileOperation::ProcessTreeCompleted
        )
    }
}

impl fmt::Display for ReportedFileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of checking an access against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessStatus {
    Allowed,
    Denied,
    /// The path could not be placed in the manifest (relative, empty, ...).
    CannotDeterminePolicy,
}

impl FileAccessStatus {
    pub fn code(self) -> u8 {
        match self {
            FileAccessStatus::Allowed => 1,
            FileAccessStatus::Denied => 2,
            FileAccessStatus::CannotDeterminePolicy => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FileAccessStatus::Allowed),
            2 => Some(FileAccessStatus::Denied),
            3 => Some(FileAccessStatus::CannotDeterminePolicy),
            _ => None,
        }
    }
}

/// How a status was determined.
///
/// Caching treats `FileExistenceBased` as weaker than `PolicyBased`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessStatusMethod {
    PolicyBased,
    FileExistenceBased,
    TrustedTool,
}

impl FileAccessStatusMethod {
    pub fn code(self) -> u8 {
        match self {
            FileAccessStatusMethod::PolicyBased => 0,
            FileAccessStatusMethod::FileExistenceBased => 1,
            FileAccessStatusMethod::TrustedTool => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FileAccessStatusMethod::PolicyBased),
            1 => Some(FileAccessStatusMethod::FileExistenceBased),
            2 => Some(FileAccessStatusMethod::TrustedTool),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reported process
// ─────────────────────────────────────────────────────────────────────────────

/// A process observed in the sandboxed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedProcess {
    pub process_id: u32,
    pub parent_process_id: Option<u32>,
    /// Executable image path.
    pub path: PathBuf,
    pub args: Option<String>,
    pub exit_code: Option<i32>,
}

impl ReportedProcess {
    pub fn new(process_id: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            process_id,
            parent_process_id: None,
            path: path.into(),
            args: None,
            exit_code: None,
        }
    }

    pub fn with_parent(mut self, parent_process_id: u32) -> Self {
        self.parent_process_id = Some(parent_process_id);
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reported file access
// ─────────────────────────────────────────────────────────────────────────────

/// Deduplication key for an access set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccessKey {
    pub operation: ReportedFileOperation,
    pub path: PathBuf,
}

/// A single observed access.
///
/// Values are never mutated in place; the `with_*` methods return updated
/// copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportedFileAccess {
    pub operation: ReportedFileOperation,
    pub process_id: u32,
    pub requested_access: RequestedAccess,
    pub status: FileAccessStatus,
    pub method: FileAccessStatusMethod,
    /// Reported directly by a trusted tool rather than observed.
    pub explicitly_reported: bool,
    /// OS error code of the operation, 0 on success. For `ProcessExit`
    /// reports this carries the exit code.
    pub error: u32,
    /// Path as the tool used it.
    pub path: PathBuf,
    /// Path under which the access is keyed in the manifest when it differs
    /// from `path`.
    pub manifest_path: Option<PathBuf>,
    pub enumerate_pattern: Option<String>,
    pub process_args: Option<String>,
}

impl ReportedFileAccess {
    /// A policy-allowed access; classification rewrites the status later.
    pub fn new(
        operation: ReportedFileOperation,
        process_id: u32,
        requested_access: RequestedAccess,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            operation,
            process_id,
            requested_access,
            status: FileAccessStatus::Allowed,
            method: FileAccessStatusMethod::PolicyBased,
            explicitly_reported: false,
            error: 0,
            path: path.into(),
            manifest_path: None,
            enumerate_pattern: None,
            process_args: None,
        }
    }

    /// A read-probe of `path`.
    pub fn probe(process_id: u32, path: impl Into<PathBuf>) -> Self {
        Self::new(
            ReportedFileOperation::Probe,
            process_id,
            RequestedAccess::PROBE,
            path,
        )
    }

    pub fn with_status(mut self, status: FileAccessStatus, method: FileAccessStatusMethod) -> Self {
        self.status = status;
        self.method = method;
        self
    }

    pub fn with_manifest_path(mut self, manifest_path: impl Into<PathBuf>) -> Self {
        let manifest_path = manifest_path.into();
        self.manifest_path = (manifest_path != self.path).then_some(manifest_path);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_error(mut self, error: u32) -> Self {
        self.error = error;
        self
    }

    pub fn with_enumerate_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.enumerate_pattern = Some(pattern.into());
        self
    }

    pub fn with_process_args(mut self, args: impl Into<String>) -> Self {
        self.process_args = Some(args.into());
        self
    }

    /// Mark as reported by a trusted tool; the given status wins over policy.
    pub fn explicitly_reported(mut self, status: FileAccessStatus) -> Self {
        self.explicitly_reported = true;
        self.status = status;
        self.method = FileAccessStatusMethod::TrustedTool;
        self
    }

    /// Path used for policy lookup and deduplication.
    pub fn effective_path(&self) -> &Path {
        self.manifest_path.as_deref().unwrap_or(&self.path)
    }

    pub fn key(&self) -> AccessKey {
        AccessKey {
            operation: self.operation,
            path: self.effective_path().to_path_buf(),
        }
    }

    pub fn is_write(&self) -> bool {
        self.requested_access.contains(RequestedAccess::WRITE)
    }

    pub fn is_denied(&self) -> bool {
        self.status == FileAccessStatus::Denied
    }
}

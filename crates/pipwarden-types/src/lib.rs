//! Shared types for the pipwarden sandbox engine.
//!
//! Everything that crosses a crate boundary lives here: pip identifiers, the
//! access and policy bit sets, the decoded access-report record and the
//! textual report-line format shared by native backends and trusted tools.

#[macro_use]
mod flags;

pub mod access;
pub mod error;
pub mod ids;
pub mod policy;
pub mod report_line;

pub use access::{
    AccessKey, FileAccessStatus, FileAccessStatusMethod, ReportedFileAccess,
    ReportedFileOperation, ReportedProcess,
};
pub use error::{ReportLineError, Result};
pub use ids::PipId;
pub use policy::{FileAccessPolicy, ManifestFlags, RequestedAccess};
pub use report_line::{ParsedReportLine, encode_line, encode_process_line, parse_line};

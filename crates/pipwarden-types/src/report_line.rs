//! Textual report-line format.
//!
//! One line per event, shared by native backends and by trusted tools
//! reporting over the augmented channel:
//!
//! ```text
//! <operation>:<pid>[@<ppid>]|<requested hex>|<status>|<method>|<explicit>|<error hex>|<path>|<manifest path>|<pattern>|<args>
//! ```
//!
//! Field values escape `\`, `|`, newline and carriage return with a
//! backslash. Empty optional fields decode to `None`.

use std::path::PathBuf;

use crate::access::{
    FileAccessStatus, FileAccessStatusMethod, ReportedFileAccess, ReportedFileOperation,
};
use crate::error::{ReportLineError, Result};
use crate::policy::RequestedAccess;

const FIELD_COUNT: usize = 10;

/// A decoded line: the access plus the parent pid carried by `Process`
/// reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReportLine {
    pub access: ReportedFileAccess,
    pub parent_process_id: Option<u32>,
}

/// Encode an access as a report line (no trailing newline).
pub fn encode_line(access: &ReportedFileAccess) -> String {
    encode_with_parent(access, None)
}

/// Encode a process-start report for `pid` spawned by `parent`.
pub fn encode_process_line(
    pid: u32,
    parent: Option<u32>,
    image: &std::path::Path,
    args: Option<&str>,
) -> String {
    let mut access = ReportedFileAccess::new(
        ReportedFileOperation::Process,
        pid,
        RequestedAccess::NONE,
        image,
    );
    access.process_args = args.map(str::to_string);
    encode_with_parent(&access, parent)
}

fn encode_with_parent(access: &ReportedFileAccess, parent: Option<u32>) -> String {
    let mut line = String::with_capacity(64 + access.path.as_os_str().len());
    line.push_str(access.operation.name());
    line.push(':');
    line.push_str(&access.process_id.to_string());
    if let Some(parent) = parent {
        line.push('@');
        line.push_str(&parent.to_string());
    }

    let fields = [
        format!("{:x}", access.requested_access.bits()),
        access.status.code().to_string(),
        access.method.code().to_string(),
        u8::from(access.explicitly_reported).to_string(),
        format!("{:x}", access.error),
        access.path.to_string_lossy().into_owned(),
        access
            .manifest_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
        access.enumerate_pattern.clone().unwrap_or_default(),
        access.process_args.clone().unwrap_or_default(),
    ];
    for field in &fields {
        line.push('|');
        escape_into(field, &mut line);
    }
    line
}

/// Decode a report line. A trailing newline is tolerated.
pub fn parse_line(line: &str) -> Result<ParsedReportLine> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Err(ReportLineError::Empty);
    }

    let fields = split_fields(line)?;
    if fields.len() != FIELD_COUNT {
        return Err(ReportLineError::FieldCount {
            expected: FIELD_COUNT,
            found: fields.len(),
        });
    }

    let (operation, process_id, parent_process_id) = parse_header(&fields[0])?;

    let requested = u8::from_str_radix(&fields[1], 16)
        .map_err(|_| invalid("requested_access", &fields[1]))?;
    let status = fields[2]
        .parse::<u8>()
        .ok()
        .and_then(FileAccessStatus::from_code)
        .ok_or_else(|| invalid("status", &fields[2]))?;
    let method = fields[3]
        .parse::<u8>()
        .ok()
        .and_then(FileAccessStatusMethod::from_code)
        .ok_or_else(|| invalid("method", &fields[3]))?;
    let explicitly_reported = match fields[4].as_str() {
        "0" => false,
        "1" => true,
        other => return Err(invalid("explicit", other)),
    };
    let error = u32::from_str_radix(&fields[5], 16).map_err(|_| invalid("error", &fields[5]))?;

    let access = ReportedFileAccess {
        operation,
        process_id,
        requested_access: RequestedAccess::from_bits(requested),
        status,
        method,
        explicitly_reported,
        error,
        path: PathBuf::from(&fields[6]),
        manifest_path: non_empty(&fields[7]).map(PathBuf::from),
        enumerate_pattern: non_empty(&fields[8]),
        process_args: non_empty(&fields[9]),
    };

    Ok(ParsedReportLine {
        access,
        parent_process_id,
    })
}

fn parse_header(header: &str) -> Result<(ReportedFileOperation, u32, Option<u32>)> {
    let (op, ids) = header
        .split_once(':')
        .ok_or_else(|| ReportLineError::MissingHeader(header.to_string()))?;
    let operation = op.parse::<ReportedFileOperation>()?;

    let (pid, parent) = match ids.split_once('@') {
        Some((pid, parent)) => (
            pid,
            Some(parent.parse::<u32>().map_err(|_| invalid("parent_process_id", parent))?),
        ),
        None => (ids, None),
    };
    let pid = pid.parse::<u32>().map_err(|_| invalid("process_id", pid))?;
    Ok((operation, pid, parent))
}

fn invalid(field: &'static str, value: &str) -> ReportLineError {
    ReportLineError::InvalidField {
        field,
        value: value.to_string(),
    }
}

fn non_empty(field: &str) -> Option<String> {
    (!field.is_empty()).then(|| field.to_string())
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

/// Split on unescaped `|`, unescaping every field.
fn split_fields(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(other) => current.push(other),
                None => return Err(ReportLineError::DanglingEscape),
            },
            '|' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_access() -> ReportedFileAccess {
        ReportedFileAccess::new(
            ReportedFileOperation::Write,
            42,
            RequestedAccess::WRITE,
            "/out/sub/file.txt",
        )
    }

    #[test]
    fn test_encode_shape() {
        let line = encode_line(&write_access());
        assert_eq!(line, "Write:42|2|1|0|0|0|/out/sub/file.txt|||");
    }

    #[test]
    fn test_parse_encoded_line() {
        let access = write_access()
            .with_manifest_path("/real/sub/file.txt")
            .with_error(0x2)
            .with_process_args("cc -o x");
        let parsed = parse_line(&encode_line(&access)).unwrap();
        assert_eq!(parsed.access, access);
        assert!(parsed.parent_process_id.is_none());
    }

    #[test]
    fn test_escaping_of_separators() {
        let access = ReportedFileAccess::probe(1, "/weird|dir/new\nline\\x");
        let line = encode_line(&access);
        assert!(!line.contains('\n'));
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.access.path, Path::new("/weird|dir/new\nline\\x"));
    }

    #[test]
    fn test_process_line_carries_parent() {
        let line = encode_process_line(10, Some(5), Path::new("/usr/bin/cc"), Some("-c a.c"));
        assert!(line.starts_with("Process:10@5|"));
        let parsed = parse_line(&format!("{line}\n")).unwrap();
        assert_eq!(parsed.parent_process_id, Some(5));
        assert_eq!(parsed.access.operation, ReportedFileOperation::Process);
        assert_eq!(parsed.access.process_args.as_deref(), Some("-c a.c"));
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert_eq!(parse_line(""), Err(ReportLineError::Empty));
        assert!(matches!(
            parse_line("Write42|2|1|0|0|0|/x|||"),
            Err(ReportLineError::MissingHeader(_))
        ));
        assert!(matches!(
            parse_line("Frobnicate:1|2|1|0|0|0|/x|||"),
            Err(ReportLineError::UnknownOperation(_))
        ));
        assert!(matches!(
            parse_line("Write:1|2|1"),
            Err(ReportLineError::FieldCount { found: 3, .. })
        ));
        assert!(matches!(
            parse_line("Write:1|2|9|0|0|0|/x|||"),
            Err(ReportLineError::InvalidField { field: "status", .. })
        ));
        assert_eq!(
            parse_line("Write:1|2|1|0|0|0|/x|||\\"),
            Err(ReportLineError::DanglingEscape)
        );
    }
}

//! Append-only journal of writes under shared opaque output directories.
//!
//! Each record is one absolute path: a little-endian `u32` count of UTF-16
//! code units followed by the UTF-16LE units. No header, no checksum. Every
//! record is synced before `record_write` returns, so a crash can only lose
//! the tail of the record being written.
//!
//! One journal per invocation; it is never shared between writers.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipwarden_types::PipId;
use thiserror::Error;

use crate::error::{SandboxError, SandboxResult};
use crate::paths::normalize;

/// The I/O failure that stopped a journal.
#[derive(Debug, Clone, Error)]
#[error("failed to journal write of {} to {}: {source}", .path.display(), .journal.display())]
pub struct JournalFault {
    pub journal: PathBuf,
    /// Path whose record could not be written.
    pub path: PathBuf,
    #[source]
    pub source: Arc<std::io::Error>,
}

/// Journal file for `pip_id` inside `dir`.
pub fn journal_path_for(dir: &Path, pip_id: PipId) -> PathBuf {
    dir.join(format!("{}.sharedopaque", pip_id.file_stem()))
}

/// Single-writer journal.
#[derive(Debug)]
pub struct SharedOpaqueJournal {
    path: PathBuf,
    roots: Vec<PathBuf>,
    file: Option<File>,
    fault: Option<JournalFault>,
    recorded: usize,
}

impl SharedOpaqueJournal {
    /// Create (truncating) the journal at `path` for writes under `roots`.
    pub fn create(path: impl Into<PathBuf>, roots: Vec<PathBuf>) -> SandboxResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| SandboxError::JournalOpen {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| SandboxError::JournalOpen {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            roots: roots.iter().map(|r| normalize(r)).collect(),
            file: Some(file),
            fault: None,
            recorded: 0,
        })
    }

    /// Record a write of `path`.
    ///
    /// Returns whether `path` lies under one of the shared roots. Writes
    /// outside every root are skipped. After the first I/O fault the journal
    /// is closed and later writes are dropped; the fault is kept for the
    /// caller to surface.
    pub fn record_write(&mut self, path: &Path) -> bool {
        let path = normalize(path);
        if !self.roots.iter().any(|root| path.starts_with(root)) {
            return false;
        }

        let Some(file) = self.file.as_mut() else {
            tracing::trace!(path = %path.display(), "Journal faulted; dropping write record");
            return true;
        };

        if let Err(e) = write_record(file, &path) {
            tracing::warn!(
                journal = %self.path.display(),
                path = %path.display(),
                error = %e,
                "Shared opaque journal write failed; journal closed"
            );
            self.fault = Some(JournalFault {
                journal: self.path.clone(),
                path,
                source: Arc::new(e),
            });
            self.file = None;
        } else {
            self.recorded += 1;
        }
        true
    }

    pub fn fault(&self) -> Option<&JournalFault> {
        self.fault.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Records successfully written.
    pub fn recorded(&self) -> usize {
        self.recorded
    }
}

fn write_record(file: &mut File, path: &Path) -> std::io::Result<()> {
    let units: Vec<u16> = path.to_string_lossy().encode_utf16().collect();
    let mut record = Vec::with_capacity(4 + units.len() * 2);
    record.extend_from_slice(&record_len(units.len())?.to_le_bytes());
    for unit in units {
        record.extend_from_slice(&unit.to_le_bytes());
    }
    file.write_all(&record)?;
    file.sync_data()
}

/// Length prefix for a record of `units` UTF-16 code units.
fn record_len(units: usize) -> std::io::Result<u32> {
    u32::try_from(units).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path of {units} UTF-16 units does not fit a journal record"),
        )
    })
}

/// Replay a journal.
///
/// Stops at end of file or at the first record that cannot be decoded; a
/// truncated tail is not an error. Paths are returned in file order,
/// duplicates included.
pub fn read_journal(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let data = std::fs::read(path)?;
    Ok(decode_records(&data))
}

fn decode_records(mut data: &[u8]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    while data.len() >= 4 {
        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let Some(byte_len) = count.checked_mul(2) else {
            break;
        };
        let body = &data[4..];
        if body.len() < byte_len {
            break;
        }
        let units: Vec<u16> = body[..byte_len]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        match String::from_utf16(&units) {
            Ok(s) => paths.push(PathBuf::from(s)),
            Err(_) => break,
        }
        data = &body[byte_len..];
    }
    paths
}

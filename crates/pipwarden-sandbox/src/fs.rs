//! Filesystem queries used by classification and symlink resolution.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// The subset of filesystem state the engine consults.
pub trait FileSystemView: Send + Sync {
    /// Whether anything exists at `path` (without following a final symlink).
    fn exists(&self, path: &Path) -> bool;

    /// If `path` is a symlink or junction to a directory, its target.
    ///
    /// Relative targets are returned as stored; callers resolve them against
    /// the link's parent.
    fn read_directory_link(&self, path: &Path) -> io::Result<Option<PathBuf>>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl FileSystemView for RealFileSystem {
    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn read_directory_link(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        let meta = std::fs::symlink_metadata(path)?;
        if !meta.file_type().is_symlink() {
            return Ok(None);
        }
        // Follows the link; fails when the target is gone.
        if !std::fs::metadata(path)?.is_dir() {
            return Ok(None);
        }
        std::fs::read_link(path).map(Some)
    }
}

/// In-memory filesystem for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    entries: RwLock<HashSet<PathBuf>>,
    links: RwLock<HashMap<PathBuf, PathBuf>>,
    queries: RwLock<Vec<PathBuf>>,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` and all of its ancestors as existing.
    pub fn add(&self, path: impl AsRef<Path>) -> &Self {
        let mut entries = self.entries.write();
        for ancestor in path.as_ref().ancestors() {
            entries.insert(ancestor.to_path_buf());
        }
        self
    }

    /// Add a directory link at `path` pointing at `target`.
    pub fn add_link(&self, path: impl AsRef<Path>, target: impl Into<PathBuf>) -> &Self {
        self.add(path.as_ref());
        self.links
            .write()
            .insert(path.as_ref().to_path_buf(), target.into());
        self
    }

    /// Every path passed to `read_directory_link`, in call order.
    pub fn link_queries(&self) -> Vec<PathBuf> {
        self.queries.read().clone()
    }
}

impl FileSystemView for InMemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.entries.read().contains(path)
    }

    fn read_directory_link(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        self.queries.write().push(path.to_path_buf());
        Ok(self.links.read().get(path).cloned())
    }
}

//! Resolution of access paths through intermediate directory symlinks.
//!
//! The final segment of a reported path is taken as-is (the backend reports
//! operations on links themselves); every directory above it is rewritten to
//! its symlink-free form. Results are cached in two process-wide maps shared
//! by every invocation:
//!
//! - resolved directory by unresolved directory
//! - link target (or its absence) by directory
//!
//! Both use insert-if-absent. Concurrent computations for the same key produce
//! the same value, so whichever insert lands first is kept.
//!
//! Resolution never fails: a link whose target cannot be read is treated as
//! an ordinary directory, and a directory whose resolution runs into a link
//! cycle is left as it is. Only resolutions that finished are cached, so the
//! answer for a path does not depend on what was resolved before it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use pipwarden_types::ReportedFileAccess;

use crate::fs::FileSystemView;
use crate::paths::normalize;

/// Outcome of resolving one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: PathBuf,
    /// `resolved` differs from the input.
    pub changed: bool,
}

/// Shared, caching resolver.
pub struct SymlinkedAccessResolver {
    fs: Arc<dyn FileSystemView>,
    resolved_by_parent: DashMap<PathBuf, PathBuf>,
    link_targets: DashMap<PathBuf, Option<PathBuf>>,
}

impl std::fmt::Debug for SymlinkedAccessResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymlinkedAccessResolver")
            .field("resolved_by_parent", &self.resolved_by_parent.len())
            .field("link_targets", &self.link_targets.len())
            .finish()
    }
}

impl SymlinkedAccessResolver {
    pub fn new(fs: Arc<dyn FileSystemView>) -> Self {
        Self {
            fs,
            resolved_by_parent: DashMap::new(),
            link_targets: DashMap::new(),
        }
    }

    /// Resolve every directory above the final segment of `path`.
    ///
    /// Relative paths and paths without a parent are returned unchanged.
    pub fn resolve(&self, path: &Path) -> Resolution {
        let unchanged = || Resolution {
            resolved: path.to_path_buf(),
            changed: false,
        };
        if !path.is_absolute() {
            return unchanged();
        }
        let path = normalize(path);
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return unchanged();
        };

        let mut in_progress = HashSet::new();
        let resolved = match self.resolve_directory(parent, &mut in_progress) {
            Some(dir) => dir.join(name),
            None => path.clone(),
        };
        let changed = resolved != path;
        Resolution { resolved, changed }
    }

    /// Apply [`resolve`](Self::resolve) to an access, recording the resolved
    /// path as its manifest path.
    pub fn resolve_access(&self, access: ReportedFileAccess) -> ReportedFileAccess {
        let resolution = self.resolve(access.effective_path());
        if resolution.changed {
            tracing::trace!(
                path = %access.path.display(),
                resolved = %resolution.resolved.display(),
                "Resolved access through directory symlink"
            );
            access.with_manifest_path(resolution.resolved)
        } else {
            access
        }
    }

    /// Probe accesses for every ancestor directory of the access's effective
    /// path that is a link, skipping paths already in `seen`.
    ///
    /// Only the ancestors of that path are examined. Targets of those links
    /// are not walked, so a link reached through another link's target does
    /// not get a probe.
    pub fn synthesize_probes_for_symlink_chain(
        &self,
        access: &ReportedFileAccess,
        seen: &mut HashSet<PathBuf>,
    ) -> Vec<ReportedFileAccess> {
        let path = access.effective_path();
        if !path.is_absolute() {
            return Vec::new();
        }
        let path = normalize(path);
        let mut probes = Vec::new();
        for ancestor in path.ancestors().skip(1) {
            if ancestor.parent().is_none() {
                break;
            }
            if self.link_target(ancestor).is_some() && seen.insert(ancestor.to_path_buf()) {
                probes.push(ReportedFileAccess::probe(access.process_id, ancestor));
            }
        }
        // Outermost link first.
        probes.reverse();
        probes
    }

    /// Whether `path` has been found to be a link. Unknown paths report false.
    pub fn is_known_symlink(&self, path: &Path) -> bool {
        self.link_targets.get(path).is_some_and(|t| t.is_some())
    }

    /// Number of cached directory resolutions.
    pub fn cached_resolutions(&self) -> usize {
        self.resolved_by_parent.len()
    }

    /// Symlink-free form of directory `dir`, or `None` when its resolution
    /// runs into a directory already being resolved further up (a cycle).
    ///
    /// Parent walks and link hops are both unbounded; `in_progress` holds the
    /// directories on the current resolution stack.
    fn resolve_directory(&self, dir: &Path, in_progress: &mut HashSet<PathBuf>) -> Option<PathBuf> {
        if let Some(hit) = self.resolved_by_parent.get(dir) {
            return Some(hit.clone());
        }
        let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
            return Some(dir.to_path_buf());
        };
        if !in_progress.insert(dir.to_path_buf()) {
            tracing::debug!(dir = %dir.display(), "Symlink cycle; assuming canonical");
            return None;
        }

        // Parent first, then this segment on top of it.
        let resolved = self.resolve_directory(parent, in_progress).and_then(|parent_resolved| {
            let candidate = parent_resolved.join(name);
            match self.link_target(&candidate) {
                Some(target) => {
                    let target = normalize(&parent_resolved.join(target));
                    self.resolve_directory(&target, in_progress)
                }
                None => Some(candidate),
            }
        });
        in_progress.remove(dir);

        let resolved = resolved?;
        self.resolved_by_parent
            .entry(dir.to_path_buf())
            .or_insert_with(|| resolved.clone());
        Some(resolved)
    }

    /// Target of `path` if it is a directory link, consulting the cache first.
    fn link_target(&self, path: &Path) -> Option<PathBuf> {
        if let Some(known) = self.link_targets.get(path) {
            return known.clone();
        }

        let target = match self.fs.read_directory_link(path) {
            Ok(target) => target,
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "Link unreadable; assuming canonical");
                None
            }
        };
        self.link_targets
            .entry(path.to_path_buf())
            .or_insert(target)
            .clone()
    }
}

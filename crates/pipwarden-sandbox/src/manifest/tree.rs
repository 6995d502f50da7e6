//! Policy tree keyed by path segment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pipwarden_types::FileAccessPolicy;

use crate::paths::segments;

/// One node of the policy tree.
///
/// `node_policy` applies to this exact path only; `cone_policy` applies to
/// this path and everything below it. Children are ordered so encoding is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PolicyNode {
    pub(crate) node_policy: Option<FileAccessPolicy>,
    pub(crate) cone_policy: Option<FileAccessPolicy>,
    pub(crate) children: BTreeMap<String, PolicyNode>,
}

/// Result of a policy lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLookup {
    /// The declared path whose policy applied; `None` when the default was used.
    pub matched: Option<PathBuf>,
    pub policy: FileAccessPolicy,
    /// The match came from a node policy on the exact path.
    pub exact: bool,
}

impl PolicyNode {
    /// Get or create the node for `path`.
    pub(crate) fn node_mut(&mut self, path: &Path) -> &mut PolicyNode {
        segments(path)
            .into_iter()
            .fold(self, |node, segment| node.children.entry(segment).or_default())
    }

    /// Longest-prefix lookup.
    ///
    /// The exact node's node policy wins; otherwise the deepest cone policy on
    /// the way down; otherwise `default`.
    pub(crate) fn lookup(&self, path: &Path, default: FileAccessPolicy) -> PolicyLookup {
        let segs = segments(path);
        let mut best: Option<(usize, FileAccessPolicy)> = self.cone_policy.map(|p| (0, p));
        let mut node = self;
        let mut depth = 0;

        for segment in &segs {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    depth += 1;
                    if let Some(cone) = node.cone_policy {
                        best = Some((depth, cone));
                    }
                }
                None => break,
            }
        }

        if depth == segs.len()
            && let Some(policy) = node.node_policy
        {
            return PolicyLookup {
                matched: Some(prefix_path(path, depth)),
                policy,
                exact: true,
            };
        }

        match best {
            Some((depth, policy)) => PolicyLookup {
                matched: Some(prefix_path(path, depth)),
                policy,
                exact: false,
            },
            None => PolicyLookup {
                matched: None,
                policy: default,
                exact: false,
            },
        }
    }

    /// Visit every node carrying a policy, in deterministic order.
    pub(crate) fn for_each_declared(&self, mut f: impl FnMut(&Path, &PolicyNode)) {
        fn walk(node: &PolicyNode, path: &mut PathBuf, f: &mut dyn FnMut(&Path, &PolicyNode)) {
            if node.node_policy.is_some() || node.cone_policy.is_some() {
                f(path, node);
            }
            for (segment, child) in &node.children {
                path.push(segment);
                walk(child, path, f);
                path.pop();
            }
        }
        let mut path = PathBuf::from(std::path::MAIN_SEPARATOR_STR);
        walk(self, &mut path, &mut f);
    }

    pub(crate) fn node_count(&self) -> usize {
        1 + self.children.values().map(PolicyNode::node_count).sum::<usize>()
    }
}

/// Rebuild the absolute prefix of `path` made of its first `depth` segments.
fn prefix_path(path: &Path, depth: usize) -> PathBuf {
    let mut out = PathBuf::from(std::path::MAIN_SEPARATOR_STR);
    for segment in segments(path).into_iter().take(depth) {
        out.push(segment);
    }
    out
}

//! Pure mapping between the remote content tree and local relative paths,
//! plus detection and repair of the deprecated sibling layout.
//!
//! Two layouts exist for a node with children: the index pattern
//! (`{slug}/index.md`, current) and the sibling pattern (`{slug}.md` next to
//! a `{slug}/` directory, deprecated). All functions here work on relative
//! paths with `/` separators; only the sibling migration helpers touch the
//! file system.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::error::StoreError;
use crate::model::ContentType;

/// The shape of a remote node the mapper needs; a projection of what the
/// remote API returns for one page or folder.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RemoteNode {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    /// Ancestor ids, root first.
    pub ancestors: Vec<String>,
    pub content_type: ContentType,
    pub has_children: bool,
}

/// Options shared by `compute_file_path` and `build_path_map`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PathOptions {
    /// When set, ancestors up to and including this id are dropped from the
    /// directory chain, so the chosen subtree's children land at the sync
    /// root instead of being nested under it.
    pub root_ancestor_id: Option<String>,
}

/// Result of parsing a local relative path back into tree coordinates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParsedPath {
    pub slug: String,
    pub parent_slug: Option<String>,
    /// Directory slugs above the node, root first.
    pub ancestor_slugs: Vec<String>,
    pub is_index: bool,
}

/// Turn a title into a path segment: lowercase, alphanumeric runs joined by
/// `-`, never empty.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    slug
}

/// Compute the local relative path for one remote node.
///
/// A folder, or any node with children, becomes an index file
/// (`dir/slug/index.md`); everything else a leaf file (`dir/slug.md`). `dir`
/// is the slugified ancestor chain, root to parent, optionally truncated at
/// `options.root_ancestor_id`. Collisions against `existing` are resolved
/// with a deterministic numeric suffix: on the filename for leaves, on the
/// directory segment for index files (never on `index.md` itself).
#[must_use]
pub fn compute_file_path(
    node: &RemoteNode,
    titles: &BTreeMap<String, String>,
    existing: &BTreeSet<String>,
    options: &PathOptions,
) -> String {
    let dir = ancestor_dir(node, titles, options);
    let slug = slugify(&node.title);
    let is_index = node.content_type == ContentType::Folder || node.has_children;

    let mut candidate = render(&dir, &slug, is_index);
    let mut suffix = 2_u32;
    while existing.contains(&candidate) {
        let suffixed = format!("{slug}-{suffix}");
        candidate = render(&dir, &suffixed, is_index);
        suffix += 1;
    }
    candidate
}

fn render(dir: &str, slug: &str, is_index: bool) -> String {
    if is_index {
        format!("{dir}{slug}/index.md")
    } else {
        format!("{dir}{slug}.md")
    }
}

fn ancestor_dir(
    node: &RemoteNode,
    titles: &BTreeMap<String, String>,
    options: &PathOptions,
) -> String {
    let chain: &[String] = match &options.root_ancestor_id {
        Some(root_id) => {
            if node.id == *root_id {
                &[]
            } else if let Some(pos) = node.ancestors.iter().position(|id| id == root_id) {
                &node.ancestors[pos + 1..]
            } else {
                &node.ancestors[..]
            }
        }
        None => &node.ancestors[..],
    };

    let mut dir = String::new();
    for ancestor_id in chain {
        let segment = titles
            .get(ancestor_id)
            .map_or_else(|| slugify(ancestor_id), |title| slugify(title.as_str()));
        dir.push_str(&segment);
        dir.push('/');
    }
    dir
}

/// Recover tree coordinates from a relative path: `a/b/index.md` is the index
/// file of node `b` under `a`; `a/b/c.md` is leaf `c` under `a/b`.
#[must_use]
pub fn parse_file_path(path: &str) -> ParsedPath {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    let file = segments.last().copied().unwrap_or_default();

    if file == "index.md" && segments.len() >= 2 {
        let slug = segments[segments.len() - 2].to_string();
        let ancestor_slugs: Vec<String> =
            segments[..segments.len() - 2].iter().map(ToString::to_string).collect();
        return ParsedPath {
            slug,
            parent_slug: ancestor_slugs.last().cloned(),
            ancestor_slugs,
            is_index: true,
        };
    }

    let slug = file.strip_suffix(".md").unwrap_or(file).to_string();
    let ancestor_slugs: Vec<String> = segments
        .get(..segments.len().saturating_sub(1))
        .unwrap_or_default()
        .iter()
        .map(ToString::to_string)
        .collect();
    ParsedPath { slug, parent_slug: ancestor_slugs.last().cloned(), ancestor_slugs, is_index: false }
}

/// Map every node of a tree to a collision-free local path.
///
/// Nodes are processed parents-first (sorted by ancestor depth, ties broken
/// by id for determinism) so ancestor titles are always resolvable, and each
/// assigned path joins the collision set for the nodes that follow.
#[must_use]
pub fn build_path_map(nodes: &[RemoteNode], options: &PathOptions) -> BTreeMap<String, String> {
    let titles: BTreeMap<String, String> =
        nodes.iter().map(|node| (node.id.clone(), node.title.clone())).collect();

    let mut order: Vec<&RemoteNode> = nodes.iter().collect();
    order.sort_by(|a, b| {
        a.ancestors.len().cmp(&b.ancestors.len()).then_with(|| a.id.cmp(&b.id))
    });

    let mut existing = BTreeSet::new();
    let mut map = BTreeMap::new();
    for node in order {
        let path = compute_file_path(node, &titles, &existing, options);
        existing.insert(path.clone());
        map.insert(node.id.clone(), path);
    }
    map
}

/// True when `rel` is stored in the deprecated sibling pattern: a leaf file
/// `parent.md` coexisting with a `parent/` directory that holds children.
#[must_use]
pub fn uses_sibling_pattern(root: &Path, rel: &str) -> bool {
    let Some(stem) = rel.strip_suffix(".md") else {
        return false;
    };
    if rel.ends_with("/index.md") || rel == "index.md" {
        return false;
    }
    root.join(rel).is_file() && root.join(stem).is_dir()
}

/// The index-pattern equivalent of a sibling-pattern path:
/// `a/parent.md` becomes `a/parent/index.md`.
#[must_use]
pub fn sibling_index_path(rel: &str) -> String {
    match rel.strip_suffix(".md") {
        Some(stem) => format!("{stem}/index.md"),
        None => rel.to_string(),
    }
}

/// Move a tracked file between two relative paths, creating target
/// directories and pruning now-empty source directories up to (but never
/// including) the sync root. Idempotent on retry: when the source is already
/// gone and the target exists, this is a no-op.
///
/// # Errors
/// Fails when the source is missing without the target existing, or on any
/// file-system error.
pub fn move_local_file(root: &Path, from_rel: &str, to_rel: &str) -> Result<(), StoreError> {
    let source = root.join(from_rel);
    let target = root.join(to_rel);

    if !source.exists() {
        if target.exists() {
            tracing::debug!(from = from_rel, to = to_rel, "move already applied, skipping");
            return Ok(());
        }
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("cannot move missing file {from_rel}"),
        )));
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&source, &target)?;
    tracing::debug!(from = from_rel, to = to_rel, "moved local file");

    prune_empty_dirs(root, source.parent());
    Ok(())
}

/// Migrate one sibling-pattern path to the index pattern, returning the new
/// relative path.
///
/// # Errors
/// Fails when the underlying file move fails.
pub fn migrate_sibling_to_index(root: &Path, rel: &str) -> Result<String, StoreError> {
    let target_rel = sibling_index_path(rel);
    move_local_file(root, rel, &target_rel)?;
    Ok(target_rel)
}

fn prune_empty_dirs(root: &Path, start: Option<&Path>) {
    let mut current = start;
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let is_empty = fs::read_dir(dir).map(|mut entries| entries.next().is_none());
        match is_empty {
            Ok(true) => {
                if fs::remove_dir(dir).is_err() {
                    break;
                }
                current = dir.parent();
            }
            _ => break,
        }
    }
}

//! In-memory tar archives for Docker's archive-upload endpoint.
//!
//! Template file trees arrive as flat node lists linked by `parent_id`.
//! [`flatten_tree`] walks them into path-prefixed entries (directories
//! first, then `sort_order`, then name), rendering each file body through
//! a [`TemplateRenderer`]. [`build_tar`] then packs any entry list into a
//! single buffer.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use thiserror::Error;
use uuid::Uuid;

use crate::template::{TemplateError, TemplateRenderer, Variables};

/// Errors building an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Invalid archive path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed to render {path}: {source}")]
    Render {
        path: String,
        #[source]
        source: TemplateError,
    },

    #[error("Tar write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One node of a caller-supplied template file tree.
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub is_directory: bool,
    pub sort_order: i32,
    /// Unrendered body; ignored for directories.
    pub content: String,
}

impl TemplateNode {
    pub fn directory(name: impl Into<String>, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            name: name.into(),
            is_directory: true,
            sort_order: 0,
            content: String::new(),
        }
    }

    pub fn file(name: impl Into<String>, parent_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            name: name.into(),
            is_directory: false,
            sort_order: 0,
            content: content.into(),
        }
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }
}

/// A file or directory to place in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative path, `/`-separated.
    pub path: String,
    pub content: Vec<u8>,
    pub is_directory: bool,
    /// Position among siblings after sorting.
    pub order: usize,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            is_directory: false,
            order: 0,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Vec::new(),
            is_directory: true,
            order: 0,
        }
    }
}

fn sibling_order(a: &TemplateNode, b: &TemplateNode) -> std::cmp::Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then(a.sort_order.cmp(&b.sort_order))
        .then_with(|| a.name.cmp(&b.name))
}

/// Flatten a template tree into archive entries, rendering file bodies.
///
/// Nodes whose parent chain never reaches a root are skipped.
pub fn flatten_tree(
    nodes: &[TemplateNode],
    renderer: &dyn TemplateRenderer,
    variables: &Variables,
) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut children: HashMap<Option<Uuid>, Vec<&TemplateNode>> = HashMap::new();
    for node in nodes {
        children.entry(node.parent_id).or_default().push(node);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| sibling_order(a, b));
    }

    let mut walker = TreeWalker {
        children: &children,
        renderer,
        variables,
        visited: HashSet::new(),
        entries: Vec::with_capacity(nodes.len()),
    };
    walker.walk(None, "")?;

    let skipped = nodes.len() - walker.entries.len();
    if skipped > 0 {
        tracing::warn!(skipped, "Template nodes unreachable from the root were skipped");
    }
    Ok(walker.entries)
}

struct TreeWalker<'a> {
    children: &'a HashMap<Option<Uuid>, Vec<&'a TemplateNode>>,
    renderer: &'a dyn TemplateRenderer,
    variables: &'a Variables,
    visited: HashSet<Uuid>,
    entries: Vec<ArchiveEntry>,
}

impl TreeWalker<'_> {
    fn walk(&mut self, parent: Option<Uuid>, prefix: &str) -> Result<(), ArchiveError> {
        let Some(siblings) = self.children.get(&parent) else {
            return Ok(());
        };

        for (order, node) in siblings.iter().enumerate() {
            if !self.visited.insert(node.id) {
                continue;
            }
            validate_name(&node.name)?;
            let path = if prefix.is_empty() {
                node.name.clone()
            } else {
                format!("{}/{}", prefix, node.name)
            };

            if node.is_directory {
                self.entries.push(ArchiveEntry {
                    path: path.clone(),
                    content: Vec::new(),
                    is_directory: true,
                    order,
                });
                self.walk(Some(node.id), &path)?;
            } else {
                let rendered = self
                    .renderer
                    .render(&node.content, self.variables)
                    .map_err(|source| ArchiveError::Render {
                        path: path.clone(),
                        source,
                    })?;
                self.entries.push(ArchiveEntry {
                    path,
                    content: rendered.into_bytes(),
                    is_directory: false,
                    order,
                });
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ArchiveError::InvalidPath {
            path: name.to_string(),
            reason: "node names must be a single path component".to_string(),
        });
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), ArchiveError> {
    let invalid = |reason: &str| ArchiveError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory components")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute path")),
        }
    }
    Ok(())
}

/// Pack entries into a tar archive, in the given order.
pub fn build_tar(entries: &[ArchiveEntry]) -> Result<Vec<u8>, ArchiveError> {
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    for entry in entries {
        validate_path(&entry.path)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(mtime);

        if entry.is_directory {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            let path = format!("{}/", entry.path.trim_end_matches('/'));
            builder.append_data(&mut header, path, std::io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(entry.content.len() as u64);
            builder.append_data(&mut header, &entry.path, entry.content.as_slice())?;
        }
    }

    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::template::MustacheRenderer;

    fn extract(archive: &[u8]) -> Vec<(String, Vec<u8>, bool)> {
        let mut out = Vec::new();
        let mut reader = tar::Archive::new(archive);
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let is_dir = entry.header().entry_type().is_dir();
            let path = entry
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((path, content, is_dir));
        }
        out
    }

    #[test]
    fn test_round_trip_preserves_paths_and_bytes() {
        let entries = vec![
            ArchiveEntry::directory("config"),
            ArchiveEntry::file("config/app.exs", "import Config\n"),
            ArchiveEntry::file("README.md", "# Sandbox\n"),
            ArchiveEntry::file("bin/blob", vec![0u8, 159, 146, 150, 255]),
        ];
        let archive = build_tar(&entries).unwrap();
        let extracted = extract(&archive);

        let expected: Vec<(String, Vec<u8>, bool)> = entries
            .iter()
            .map(|e| (e.path.clone(), e.content.clone(), e.is_directory))
            .collect();
        assert_eq!(extracted, expected);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        assert!(build_tar(&[ArchiveEntry::file("../etc/passwd", "x")]).is_err());
        assert!(build_tar(&[ArchiveEntry::file("/etc/passwd", "x")]).is_err());
        assert!(build_tar(&[ArchiveEntry::file("", "x")]).is_err());
    }

    #[test]
    fn test_flatten_orders_directories_first() {
        let lib = TemplateNode::directory("lib", None).with_sort_order(5);
        let nodes = vec![
            TemplateNode::file("mix.exs", None, "app: {{ app }}").with_sort_order(0),
            TemplateNode::file("b.ex", Some(lib.id), "b").with_sort_order(2),
            TemplateNode::file("a.ex", Some(lib.id), "a").with_sort_order(2),
            TemplateNode::file("z.ex", Some(lib.id), "z").with_sort_order(1),
            TemplateNode::directory("assets", None).with_sort_order(9),
            lib,
        ];
        let vars = Variables::from([("app".to_string(), "demo".to_string())]);

        let entries = flatten_tree(&nodes, &MustacheRenderer, &vars).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["lib", "lib/z.ex", "lib/a.ex", "lib/b.ex", "assets", "mix.exs"]
        );
        assert_eq!(entries[5].content, b"app: demo".to_vec());
    }

    #[test]
    fn test_directories_sort_before_files_in_archive() {
        let dir = TemplateNode::directory("src", None).with_sort_order(10);
        let nodes = vec![
            TemplateNode::file("Makefile", None, "all:").with_sort_order(0),
            TemplateNode::file("main.rs", Some(dir.id), "fn main() {}"),
            dir,
        ];
        let entries = flatten_tree(&nodes, &MustacheRenderer, &Variables::new()).unwrap();
        let extracted = extract(&build_tar(&entries).unwrap());

        let names: Vec<(&str, bool)> = extracted
            .iter()
            .map(|(p, _, d)| (p.as_str(), *d))
            .collect();
        assert_eq!(
            names,
            vec![("src", true), ("src/main.rs", false), ("Makefile", false)]
        );
    }

    #[test]
    fn test_directory_content_is_not_rendered() {
        let mut dir = TemplateNode::directory("cfg", None);
        dir.content = "{{ undefined }}".to_string();
        let entries = flatten_tree(&[dir], &MustacheRenderer, &Variables::new()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_directory);
    }

    #[test]
    fn test_render_failure_names_the_file() {
        let nodes = vec![TemplateNode::file("setup.sh", None, "{{ nope }}")];
        let err = flatten_tree(&nodes, &MustacheRenderer, &Variables::new()).unwrap_err();
        assert!(err.to_string().contains("setup.sh"));
    }

    #[test]
    fn test_orphans_are_skipped() {
        let nodes = vec![
            TemplateNode::file("kept.txt", None, "k"),
            TemplateNode::file("orphan.txt", Some(Uuid::new_v4()), "o"),
        ];
        let entries = flatten_tree(&nodes, &MustacheRenderer, &Variables::new()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "kept.txt");
    }
}

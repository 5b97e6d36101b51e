//! Archive entries derived from descendant rows.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::node::{Node, TreeRow};
use crate::storage::BlobStore;
use crate::{CumulusError, Result};

/// One entry in a directory archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEntry {
    /// An empty directory; the path ends with `/`.
    Directory { path: String },
    /// A file streamed from its blob.
    File {
        path: String,
        source: PathBuf,
        size: u64,
        modified: DateTime<Utc>,
    },
}

impl ArchiveEntry {
    /// Path relative to the archived root.
    pub fn path(&self) -> &str {
        match self {
            ArchiveEntry::Directory { path } | ArchiveEntry::File { path, .. } => path,
        }
    }
}

/// Lazily yields the entries of a subtree.
///
/// Paths are rebuilt by following parent links through every row of the
/// subtree, so the order of the input rows does not matter. Only directories
/// without children get an explicit marker; every other directory is implied
/// by the paths below it.
pub struct ArchiveEntries {
    root_id: String,
    rows: std::vec::IntoIter<Node>,
    links: HashMap<String, (String, Option<String>)>,
    non_empty: HashSet<String>,
    storage: Arc<dyn BlobStore>,
}

impl ArchiveEntries {
    pub fn new(root_id: &str, rows: Vec<TreeRow>, storage: Arc<dyn BlobStore>) -> Self {
        let mut links = HashMap::with_capacity(rows.len());
        let mut non_empty = HashSet::new();
        for row in &rows {
            links.insert(
                row.node.id.clone(),
                (row.node.name.clone(), row.node.parent_id.clone()),
            );
            if let Some(parent) = &row.node.parent_id {
                non_empty.insert(parent.clone());
            }
        }

        Self {
            root_id: root_id.to_string(),
            rows: rows
                .into_iter()
                .map(|row| row.node)
                .collect::<Vec<_>>()
                .into_iter(),
            links,
            non_empty,
            storage,
        }
    }

    fn relative_path(&self, node: &Node) -> Result<String> {
        let mut segments = vec![node.name.as_str()];
        let mut current = node.parent_id.as_deref();

        // Bounded by the number of rows so a corrupt link cannot loop forever
        for _ in 0..=self.links.len() {
            match current {
                Some(id) if id == self.root_id => {
                    segments.reverse();
                    return Ok(segments.join("/"));
                }
                Some(id) => {
                    let (name, parent) = self.links.get(id).ok_or_else(|| {
                        CumulusError::Archive(format!("{} is outside the archived tree", node.id))
                    })?;
                    segments.push(name);
                    current = parent.as_deref();
                }
                None => break,
            }
        }

        Err(CumulusError::Archive(format!(
            "{} is outside the archived tree",
            node.id
        )))
    }

    fn entry_for(&self, node: &Node) -> Result<ArchiveEntry> {
        let path = self.relative_path(node)?;
        if node.is_dir() {
            return Ok(ArchiveEntry::Directory {
                path: format!("{path}/"),
            });
        }

        Ok(ArchiveEntry::File {
            path,
            source: self.storage.resolve_path(node)?,
            size: node.size,
            modified: node.updated_at,
        })
    }
}

impl Iterator for ArchiveEntries {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.rows.next()?;
            if node.id == self.root_id {
                continue;
            }
            if node.is_dir() && self.non_empty.contains(&node.id) {
                continue;
            }
            return Some(self.entry_for(&node));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn node(id: &str, parent: Option<&str>, name: &str, is_dir: bool) -> TreeRow {
        let kind = if is_dir {
            NodeKind::Directory
        } else {
            NodeKind::File {
                mime: "text/plain".to_string(),
                digest: "d".to_string(),
            }
        };
        TreeRow {
            node: Node {
                id: id.to_string(),
                parent_id: parent.map(str::to_string),
                name: name.to_string(),
                hash: format!("hash{id}"),
                size: 1,
                kind,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            depth: 0,
        }
    }

    fn tree() -> Vec<TreeRow> {
        vec![
            node("root", Some("outside"), "Docs", true),
            node("a", Some("root"), "A", true),
            node("empty", Some("root"), "Empty", true),
            node("f1", Some("root"), "top.txt", false),
            node("b", Some("a"), "B", true),
            node("f2", Some("b"), "deep.txt", false),
            node("hollow", Some("b"), "Hollow", true),
        ]
    }

    fn paths(entries: ArchiveEntries) -> Vec<String> {
        let mut paths: Vec<String> = entries
            .map(|e| e.unwrap().path().to_string())
            .collect();
        paths.sort();
        paths
    }

    fn store(temp: &TempDir) -> Arc<LocalStorage> {
        Arc::new(LocalStorage::new(temp.path().join("b"), temp.path().join("t")).unwrap())
    }

    #[test]
    fn test_entries_paths() {
        let temp = TempDir::new().unwrap();
        let storage = store(&temp);

        let entries = ArchiveEntries::new("root", tree(), storage);

        assert_eq!(
            paths(entries),
            vec!["A/B/Hollow/", "A/B/deep.txt", "Empty/", "top.txt"]
        );
    }

    #[test]
    fn test_entries_independent_of_row_order() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn BlobStore> = store(&temp);

        let mut reversed = tree();
        reversed.reverse();

        assert_eq!(
            paths(ArchiveEntries::new("root", reversed, storage.clone())),
            paths(ArchiveEntries::new("root", tree(), storage))
        );
    }

    #[test]
    fn test_file_entry_points_at_blob() {
        let temp = TempDir::new().unwrap();
        let storage = store(&temp);

        let entry = ArchiveEntries::new("root", tree(), storage.clone())
            .map(|e| e.unwrap())
            .find(|e| e.path() == "top.txt")
            .unwrap();

        match entry {
            ArchiveEntry::File { source, size, .. } => {
                assert_eq!(source, storage.blob_path("hashf1").unwrap());
                assert_eq!(size, 1);
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_orphan_row_is_an_error() {
        let temp = TempDir::new().unwrap();
        let storage = store(&temp);

        let rows = vec![
            node("root", None, "Docs", true),
            node("stray", Some("nowhere"), "stray.txt", false),
        ];
        let results: Vec<_> = ArchiveEntries::new("root", rows, storage).collect();

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CumulusError::Archive(_))));
    }

    #[test]
    fn test_empty_root_yields_nothing() {
        let temp = TempDir::new().unwrap();
        let storage = store(&temp);

        let rows = vec![node("root", None, "Docs", true)];
        assert_eq!(ArchiveEntries::new("root", rows, storage).count(), 0);
    }
}

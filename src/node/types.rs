//! Node types for the Cumulus tree.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::DIRECTORY_MIME;
use crate::{CumulusError, Result};

/// What a node is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// A file backed by a physical blob.
    File {
        /// Content type.
        mime: String,
        /// SHA-256 of the file bytes, independent of the file's location.
        digest: String,
    },
    /// A directory. Its size is the sum of its descendant file sizes.
    Directory,
}

/// A file or directory in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Unique node ID.
    pub id: String,
    /// Parent node ID (None for tree roots).
    pub parent_id: Option<String>,
    /// Display name, unique case-insensitively among siblings.
    pub name: String,
    /// Content address. For files this keys the physical blob.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// File or directory.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// When the node was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Content type; directories report `inode/directory`.
    pub fn mime(&self) -> &str {
        match &self.kind {
            NodeKind::File { mime, .. } => mime,
            NodeKind::Directory => DIRECTORY_MIME,
        }
    }

    /// Content digest of a file.
    pub fn digest(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { digest, .. } => Some(digest),
            NodeKind::Directory => None,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
}

/// Raw `nodes` row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct NodeRow {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub hash: String,
    pub digest: Option<String>,
    pub is_dir: bool,
    pub size: i64,
    pub mime: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = CumulusError;

    fn try_from(row: NodeRow) -> Result<Self> {
        let size = u64::try_from(row.size).map_err(|_| {
            CumulusError::Database(format!("node {} has negative size {}", row.id, row.size))
        })?;

        let kind = if row.is_dir {
            NodeKind::Directory
        } else {
            let digest = row.digest.ok_or_else(|| {
                CumulusError::Database(format!("file node {} has no content digest", row.id))
            })?;
            NodeKind::File {
                mime: row.mime,
                digest,
            }
        };

        Ok(Node {
            id: row.id,
            parent_id: row.parent_id,
            name: row.name,
            hash: row.hash,
            size,
            kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row returned by the recursive traversal queries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TreeRowRaw {
    #[sqlx(flatten)]
    pub node: NodeRow,
    pub depth: i64,
}

/// A node together with its distance from the traversal anchor.
///
/// For descendants, depth 0 is the subtree root itself and each level below
/// adds one. For ancestors, depth 1 is the immediate parent and the tree root
/// carries the largest depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub node: Node,
    pub depth: u32,
}

impl TryFrom<TreeRowRaw> for TreeRow {
    type Error = CumulusError;

    fn try_from(row: TreeRowRaw) -> Result<Self> {
        let depth = u32::try_from(row.depth)
            .map_err(|_| CumulusError::Database(format!("invalid depth {}", row.depth)))?;
        Ok(TreeRow {
            node: Node::try_from(row.node)?,
            depth,
        })
    }
}

/// Data for creating a new node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub parent_id: Option<String>,
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub kind: NodeKind,
}

impl NewNode {
    /// A file node pointing at the blob stored under `hash`.
    pub fn file(
        name: impl Into<String>,
        hash: impl Into<String>,
        digest: impl Into<String>,
        size: u64,
        mime: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: None,
            name: name.into(),
            hash: hash.into(),
            size,
            kind: NodeKind::File {
                mime: mime.into(),
                digest: digest.into(),
            },
        }
    }

    /// An empty directory node.
    pub fn directory(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            parent_id: None,
            name: name.into(),
            hash: hash.into(),
            size: 0,
            kind: NodeKind::Directory,
        }
    }

    /// Set the parent node.
    pub fn with_parent(mut self, parent_id: Option<&str>) -> Self {
        self.parent_id = parent_id.map(str::to_string);
        self
    }

    /// Set the initial size (used when materializing a copied directory).
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Builder for updating a node in place.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub hash: Option<String>,
    pub parent_id: Option<Option<String>>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn parent_id(mut self, parent_id: Option<&str>) -> Self {
        self.parent_id = Some(parent_id.map(str::to_string));
        self
    }

    /// Check if any fields are set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.hash.is_none() && self.parent_id.is_none()
    }
}

/// Sign of a size delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDirection {
    Increment,
    Decrement,
}

impl SizeDirection {
    pub(crate) fn operator(self) -> &'static str {
        match self {
            SizeDirection::Increment => "+",
            SizeDirection::Decrement => "-",
        }
    }
}

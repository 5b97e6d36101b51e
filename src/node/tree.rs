//! Subtree operations for Cumulus.
//!
//! Copy, move and delete whole subtrees. A move is a copy followed by removal
//! of the original directory rows; file rows are re-parented in place.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::identity::{preserve_extension, validate_name, IdentityResolver, OnExisting};
use super::repository::NodeRepository;
use super::service::{require_directory, require_node, retire_blobs, unreferenced_blobs};
use super::types::{NewNode, Node, NodeUpdate, SizeDirection, TreeRow};
use super::DEFAULT_TRANSFER_CONCURRENCY;
use crate::config::TreeConfig;
use crate::db::Database;
use crate::storage::BlobStore;
use crate::{CumulusError, Result};

/// Whether a transfer duplicates or relocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Copy,
    Move,
}

/// Options for a subtree or file transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub mode: TransferMode,
    /// Name for the transferred root; keeps the current name when None.
    pub new_name: Option<String>,
}

impl TransferOptions {
    pub fn new(mode: TransferMode) -> Self {
        Self {
            mode,
            new_name: None,
        }
    }

    /// Set the name for the transferred root.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.new_name = Some(name.into());
        self
    }
}

/// Physical blob work left for after a row has been written.
///
/// Bytes are always copied while the transaction is open; a move also names
/// the old hash, whose blob is dropped only after the commit.
struct BlobTransfer {
    from: PathBuf,
    to: PathBuf,
    retired: Option<String>,
}

/// Service for subtree copy, move and delete.
#[derive(Clone)]
pub struct NodeTreeService {
    db: Database,
    storage: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl NodeTreeService {
    /// Create a new NodeTreeService with the default transfer concurrency.
    pub fn new(db: Database, storage: Arc<dyn BlobStore>) -> Self {
        Self {
            db,
            storage,
            concurrency: DEFAULT_TRANSFER_CONCURRENCY,
        }
    }

    /// Create a NodeTreeService from a [`TreeConfig`].
    pub fn from_config(db: Database, storage: Arc<dyn BlobStore>, config: &TreeConfig) -> Self {
        Self::new(db, storage).with_concurrency(config.concurrency)
    }

    /// Set the number of concurrent file transfers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Copy or move `node` and everything below it under `new_parent_id`.
    ///
    /// Runs in one transaction: any failure, including placing a directory
    /// inside itself, leaves the database unchanged. Returns the new root
    /// followed by every transferred file.
    pub async fn copy_subtree(
        &self,
        node: &Node,
        new_parent_id: Option<&str>,
        options: TransferOptions,
    ) -> Result<Vec<Node>> {
        let mut tx = self.db.begin().await?;
        let node = require_node(&mut tx, &node.id).await?;
        if let Some(parent) = new_parent_id {
            require_directory(&mut tx, parent).await?;
        }

        if node.is_file() {
            let (moved, transfer) = match options.mode {
                TransferMode::Copy => {
                    self.attach_file_in(&mut tx, &node, new_parent_id, options.new_name.as_deref())
                        .await?
                }
                TransferMode::Move => {
                    self.move_file_in(&mut tx, &node, new_parent_id, options.new_name.as_deref())
                        .await?
                }
            };
            self.apply(&transfer).await?;
            tx.commit().await?;
            self.retire(transfer.retired.into_iter().collect()).await;
            return Ok(vec![moved]);
        }

        let name = options.new_name.as_deref().unwrap_or(&node.name);
        validate_name(name)?;

        let descendants = NodeRepository::get_descendants(&mut tx, &node.id).await?;
        if let Some(target) = new_parent_id {
            if descendants.iter().any(|row| row.node.id == target) {
                return Err(CumulusError::StructuralConflict(format!(
                    "cannot place {} inside itself",
                    node.name
                )));
            }
        }

        let resolved =
            IdentityResolver::resolve_directory(&mut tx, name, new_parent_id, None).await?;
        let new_root = NodeRepository::create(
            &mut tx,
            &NewNode::directory(resolved.name, resolved.hash)
                .with_parent(new_parent_id)
                .with_size(node.size),
        )
        .await?;

        let mut id_map: HashMap<String, String> = HashMap::new();
        id_map.insert(node.id.clone(), new_root.id.clone());

        let mut levels: BTreeMap<u32, Vec<&Node>> = BTreeMap::new();
        for row in descendants.iter().filter(|row| row.depth > 0 && row.node.is_dir()) {
            levels.entry(row.depth).or_default().push(&row.node);
        }

        let mut directories = 0usize;
        for (depth, dirs) in &levels {
            debug!("Materializing {} directories at depth {}", dirs.len(), depth);
            for dir in dirs {
                let parent = Self::mapped_parent(&id_map, dir)?;
                let resolved = IdentityResolver::resolve_directory(
                    &mut tx,
                    &dir.name,
                    Some(parent.as_str()),
                    None,
                )
                .await?;
                let created = NodeRepository::create(
                    &mut tx,
                    &NewNode::directory(resolved.name, resolved.hash)
                        .with_parent(Some(parent.as_str()))
                        .with_size(dir.size),
                )
                .await?;
                id_map.insert(dir.id.clone(), created.id);
                directories += 1;
            }
        }

        let mut files = Vec::new();
        for row in descendants.iter().filter(|row| row.node.is_file()) {
            files.push((&row.node, Self::mapped_parent(&id_map, &row.node)?));
        }
        let file_count = files.len();

        let mode = options.mode;
        let tx = Mutex::new(tx);
        let transferred: Vec<(Node, Option<String>)> = stream::iter(files)
            .map(|(file, parent)| {
                let tx = &tx;
                async move { self.transfer_file(tx, file, parent, mode).await }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        let mut tx = tx.into_inner();

        if new_root.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                &mut tx,
                &new_root.id,
                node.size,
                SizeDirection::Increment,
            )
            .await?;
        }

        if options.mode == TransferMode::Move {
            self.remove_shell(&mut tx, &node, &descendants).await?;
        }

        tx.commit().await?;

        let (transferred, retired): (Vec<Node>, Vec<Option<String>>) =
            transferred.into_iter().unzip();
        self.retire(retired.into_iter().flatten().collect()).await;

        info!(
            "{} subtree {} to {:?}: {} directories, {} files",
            match options.mode {
                TransferMode::Copy => "Copied",
                TransferMode::Move => "Moved",
            },
            node.id,
            new_parent_id,
            directories + 1,
            file_count
        );

        let mut result = Vec::with_capacity(transferred.len() + 1);
        result.push(new_root);
        result.extend(transferred);
        Ok(result)
    }

    /// Move `node` and everything below it under `new_parent_id`.
    pub async fn move_subtree(
        &self,
        node: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<Vec<Node>> {
        let mut options = TransferOptions::new(TransferMode::Move);
        options.new_name = new_name.map(str::to_string);
        self.copy_subtree(node, new_parent_id, options).await
    }

    /// Relocate a single file.
    pub async fn move_file(
        &self,
        file: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<Node> {
        let mut tx = self.db.begin().await?;
        let file = require_node(&mut tx, &file.id).await?;
        if let Some(parent) = new_parent_id {
            require_directory(&mut tx, parent).await?;
        }

        let (moved, transfer) = self.move_file_in(&mut tx, &file, new_parent_id, new_name).await?;
        self.apply(&transfer).await?;
        tx.commit().await?;
        self.retire(transfer.retired.into_iter().collect()).await;

        info!("Moved file {} to {:?}", moved.id, new_parent_id);
        Ok(moved)
    }

    /// Duplicate a single file under `new_parent_id`.
    pub async fn attach_file(
        &self,
        file: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<Node> {
        let mut tx = self.db.begin().await?;
        let file = require_node(&mut tx, &file.id).await?;
        if let Some(parent) = new_parent_id {
            require_directory(&mut tx, parent).await?;
        }

        let (attached, transfer) =
            self.attach_file_in(&mut tx, &file, new_parent_id, new_name).await?;
        self.apply(&transfer).await?;
        tx.commit().await?;

        info!("Attached copy {} of file {}", attached.id, file.id);
        Ok(attached)
    }

    /// Delete a node and its whole subtree.
    pub async fn delete_subtree(&self, node: &Node) -> Result<u64> {
        self.delete_nodes(std::slice::from_ref(node)).await
    }

    /// Delete several subtrees at once.
    ///
    /// Roots nested inside another selected root are covered by their outer
    /// root. Rows go in one transaction; blobs no longer referenced are
    /// removed after it commits. Returns the number of rows deleted.
    pub async fn delete_nodes(&self, nodes: &[Node]) -> Result<u64> {
        if nodes.is_empty() {
            return Ok(0);
        }

        let mut tx = self.db.begin().await?;
        let mut roots = Vec::with_capacity(nodes.len());
        for node in nodes {
            roots.push(require_node(&mut tx, &node.id).await?);
        }

        let selected: Vec<&str> = roots.iter().map(|n| n.id.as_str()).collect();
        let nested: HashSet<String> = NodeRepository::get_descendants_many(&mut tx, &selected)
            .await?
            .into_iter()
            .filter(|row| row.depth > 0)
            .map(|row| row.node.id)
            .collect();

        let mut seen = HashSet::new();
        let top_level: Vec<&Node> = roots
            .iter()
            .filter(|n| !nested.contains(&n.id) && seen.insert(n.id.clone()))
            .collect();

        for root in &top_level {
            if root.parent_id.is_some() {
                NodeRepository::propagate_size_to_ancestors(
                    &mut tx,
                    &root.id,
                    root.size,
                    SizeDirection::Decrement,
                )
                .await?;
            }
        }

        let top_ids: Vec<&str> = top_level.iter().map(|n| n.id.as_str()).collect();
        let mut rows = NodeRepository::get_descendants_many(&mut tx, &top_ids).await?;
        rows.sort_by(|a, b| b.depth.cmp(&a.depth));

        let ids: Vec<&str> = rows.iter().map(|row| row.node.id.as_str()).collect();
        let deleted = NodeRepository::delete_many(&mut tx, &ids).await?;
        tx.commit().await?;

        info!(
            "Deleted {} subtree(s), {} rows",
            top_level.len(),
            deleted
        );

        let mut conn = self.db.acquire().await?;
        let hashes = rows
            .iter()
            .map(|row| &row.node)
            .filter(|n| n.is_file())
            .map(|n| n.hash.as_str());
        let paths = unreferenced_blobs(&mut conn, self.storage.as_ref(), hashes).await?;
        drop(conn);
        self.storage.delete_many(&paths).await?;

        Ok(deleted)
    }

    fn mapped_parent(id_map: &HashMap<String, String>, node: &Node) -> Result<String> {
        node.parent_id
            .as_ref()
            .and_then(|old| id_map.get(old))
            .cloned()
            .ok_or_else(|| {
                CumulusError::Database(format!("parent of {} was not materialized", node.id))
            })
    }

    /// Resolve and write one file row of a subtree transfer, then copy its bytes.
    ///
    /// The transaction is held only for the row work. Returns the node and,
    /// for a move, the hash whose blob is retired after the commit.
    async fn transfer_file(
        &self,
        tx: &Mutex<Transaction<'static, Sqlite>>,
        file: &Node,
        new_parent_id: String,
        mode: TransferMode,
    ) -> Result<(Node, Option<String>)> {
        let (node, transfer) = {
            let mut guard = tx.lock().await;
            match mode {
                TransferMode::Copy => {
                    self.duplicate_file(&mut **guard, file, Some(new_parent_id.as_str()), None)
                        .await?
                }
                TransferMode::Move => {
                    self.reparent_file(&mut **guard, file, Some(new_parent_id.as_str()), None)
                        .await?
                }
            }
        };
        self.apply(&transfer).await?;
        debug!("Transferred file {} as {}", file.id, node.id);
        Ok((node, transfer.retired))
    }

    /// Single-file copy: the new ancestors grow by the file's size.
    async fn attach_file_in(
        &self,
        conn: &mut SqliteConnection,
        file: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<(Node, BlobTransfer)> {
        let (created, transfer) = self.duplicate_file(conn, file, new_parent_id, new_name).await?;

        if created.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                conn,
                &created.id,
                created.size,
                SizeDirection::Increment,
            )
            .await?;
        }
        Ok((created, transfer))
    }

    /// Create a new row for a copy of `file`, leaving sizes alone.
    async fn duplicate_file(
        &self,
        conn: &mut SqliteConnection,
        file: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<(Node, BlobTransfer)> {
        let digest = Self::digest_of(file)?;
        let name = Self::target_name(file, new_name)?;

        let resolved = IdentityResolver::resolve_file(
            conn,
            digest,
            &name,
            new_parent_id,
            OnExisting::Rename,
            None,
        )
        .await?;

        let created = NodeRepository::create(
            conn,
            &NewNode::file(resolved.name, resolved.hash, digest, file.size, file.mime())
                .with_parent(new_parent_id),
        )
        .await?;

        let transfer = BlobTransfer {
            from: self.storage.resolve_path(file)?,
            to: self.storage.resolve_path(&created)?,
            retired: None,
        };
        Ok((created, transfer))
    }

    /// Single-file move: ancestors on both sides are adjusted.
    async fn move_file_in(
        &self,
        conn: &mut SqliteConnection,
        file: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<(Node, BlobTransfer)> {
        if file.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                conn,
                &file.id,
                file.size,
                SizeDirection::Decrement,
            )
            .await?;
        }

        let (moved, transfer) = self.reparent_file(conn, file, new_parent_id, new_name).await?;

        if moved.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                conn,
                &moved.id,
                moved.size,
                SizeDirection::Increment,
            )
            .await?;
        }
        Ok((moved, transfer))
    }

    /// Point an existing file row at a new parent and name, leaving sizes alone.
    async fn reparent_file(
        &self,
        conn: &mut SqliteConnection,
        file: &Node,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<(Node, BlobTransfer)> {
        let digest = Self::digest_of(file)?;
        let name = Self::target_name(file, new_name)?;

        let resolved = IdentityResolver::resolve_file(
            conn,
            digest,
            &name,
            new_parent_id,
            OnExisting::Rename,
            Some(&file.id),
        )
        .await?;

        let moved = NodeRepository::update(
            conn,
            &file.id,
            &NodeUpdate::new()
                .name(resolved.name)
                .hash(resolved.hash)
                .parent_id(new_parent_id),
        )
        .await?
        .ok_or_else(|| CumulusError::FileNotFound(format!("node {}", file.id)))?;

        let transfer = BlobTransfer {
            from: self.storage.resolve_path(file)?,
            to: self.storage.resolve_path(&moved)?,
            retired: (moved.hash != file.hash).then(|| file.hash.clone()),
        };
        Ok((moved, transfer))
    }

    /// Drop the original directory rows after a move, deepest first.
    async fn remove_shell(
        &self,
        conn: &mut SqliteConnection,
        root: &Node,
        descendants: &[TreeRow],
    ) -> Result<()> {
        if root.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                conn,
                &root.id,
                root.size,
                SizeDirection::Decrement,
            )
            .await?;
        }

        let dirs: Vec<&str> = descendants
            .iter()
            .rev()
            .filter(|row| row.node.is_dir())
            .map(|row| row.node.id.as_str())
            .collect();
        NodeRepository::delete_many(conn, &dirs).await?;
        Ok(())
    }

    async fn apply(&self, transfer: &BlobTransfer) -> Result<()> {
        if transfer.from == transfer.to {
            return Ok(());
        }
        self.storage.copy_blob(&transfer.from, &transfer.to).await
    }

    async fn retire(&self, hashes: Vec<String>) {
        retire_blobs(&self.db, self.storage.as_ref(), &hashes).await;
    }

    fn digest_of(file: &Node) -> Result<&str> {
        file.digest()
            .ok_or_else(|| CumulusError::Validation(format!("{} is not a file", file.id)))
    }

    fn target_name(file: &Node, new_name: Option<&str>) -> Result<String> {
        let name = match new_name {
            Some(proposed) => preserve_extension(&file.name, proposed),
            None => file.name.clone(),
        };
        validate_name(&name)?;
        Ok(name)
    }
}

//! Node service for Cumulus.
//!
//! This module provides high-level node operations:
//! - Upload ingestion with deduplication
//! - Directory creation and rename
//! - Deletion with size maintenance and deferred blob removal

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::identity::{preserve_extension, validate_name, IdentityResolver, OnExisting};
use super::repository::NodeRepository;
use super::types::{NewNode, Node, NodeKind, NodeUpdate, SizeDirection};
use crate::db::Database;
use crate::storage::BlobStore;
use crate::{CumulusError, Result};

/// A staged upload handed over by the ingestion layer.
#[derive(Debug, Clone)]
pub struct UploadedBlob {
    /// Absolute path of the staged temporary file.
    pub path: PathBuf,
    /// Name of the staged file inside the staging directory.
    pub filename: String,
    /// Name the client sent.
    pub original_name: String,
    /// Content type the client sent, if any.
    pub mime_type: Option<String>,
    /// Size reported by the ingestion layer.
    pub size: u64,
}

impl UploadedBlob {
    pub fn new(path: impl Into<PathBuf>, original_name: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            filename,
            original_name: original_name.into(),
            mime_type: None,
            size,
        }
    }

    /// Set the client-supplied content type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Load `id` and require it to be a directory.
pub(crate) async fn require_directory(conn: &mut SqliteConnection, id: &str) -> Result<Node> {
    let node = NodeRepository::get_by_id(conn, id)
        .await?
        .ok_or_else(|| CumulusError::NotFound(format!("directory {id}")))?;
    if !node.is_dir() {
        return Err(CumulusError::Validation(format!(
            "target {id} is not a directory"
        )));
    }
    Ok(node)
}

/// Load `id` or fail with `FileNotFound`.
pub(crate) async fn require_node(conn: &mut SqliteConnection, id: &str) -> Result<Node> {
    NodeRepository::get_by_id(conn, id)
        .await?
        .ok_or_else(|| CumulusError::FileNotFound(format!("node {id}")))
}

/// Blob paths of `hashes` that no row references any more.
pub(crate) async fn unreferenced_blobs<'a>(
    conn: &mut SqliteConnection,
    storage: &dyn BlobStore,
    hashes: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for hash in hashes {
        if !seen.insert(hash) {
            continue;
        }
        if NodeRepository::count_by_hash(conn, hash).await? == 0 {
            paths.push(storage.blob_path(hash)?);
        }
    }
    Ok(paths)
}

/// Remove blobs left behind by committed relocations.
///
/// The relocation itself already succeeded, so a failure here leaves an
/// extra blob and is only logged.
pub(crate) async fn retire_blobs(db: &Database, storage: &dyn BlobStore, hashes: &[String]) {
    if hashes.is_empty() {
        return;
    }

    let result: Result<usize> = async {
        let mut conn = db.acquire().await?;
        let paths =
            unreferenced_blobs(&mut conn, storage, hashes.iter().map(String::as_str)).await?;
        drop(conn);
        storage.delete_many(&paths).await?;
        Ok(paths.len())
    }
    .await;

    match result {
        Ok(removed) => debug!("Retired {} relocated blob(s)", removed),
        Err(e) => warn!("Failed to remove relocated blobs: {}", e),
    }
}

/// Node service for uploads and single-node mutations.
#[derive(Clone)]
pub struct NodeService {
    db: Database,
    storage: Arc<dyn BlobStore>,
}

impl NodeService {
    /// Create a new NodeService.
    pub fn new(db: Database, storage: Arc<dyn BlobStore>) -> Self {
        Self { db, storage }
    }

    /// Get a node by ID.
    pub async fn get(&self, id: &str) -> Result<Node> {
        let mut conn = self.db.acquire().await?;
        require_node(&mut conn, id).await
    }

    /// List the children of a directory, or the tree roots.
    pub async fn list_children(&self, parent_id: Option<&str>) -> Result<Vec<Node>> {
        let mut conn = self.db.acquire().await?;
        if let Some(parent) = parent_id {
            require_directory(&mut conn, parent).await?;
        }
        NodeRepository::list_children(&mut conn, parent_id).await
    }

    /// Turn a staged upload into a persisted file node.
    ///
    /// Uploading identical bytes under the same name and parent returns the
    /// existing node. The staged file never outlives this call.
    pub async fn process(&self, blob: UploadedBlob, parent_id: Option<&str>) -> Result<Node> {
        match self.ingest(&blob, parent_id).await {
            Ok(node) => Ok(node),
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&blob.path).await {
                    warn!("Failed to remove staged upload {}: {}", blob.filename, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn ingest(&self, blob: &UploadedBlob, parent_id: Option<&str>) -> Result<Node> {
        validate_name(&blob.original_name)?;

        let mut tx = self.db.begin().await?;
        if let Some(parent) = parent_id {
            require_directory(&mut tx, parent).await?;
        }

        let (resolved, digest) =
            IdentityResolver::resolve_identity(&mut tx, &blob.path, &blob.original_name, parent_id)
                .await
                .map_err(|e| match e {
                    CumulusError::Io(io) => {
                        CumulusError::Upload(format!("cannot read staged upload: {io}"))
                    }
                    other => other,
                })?;

        if digest.size != blob.size {
            warn!(
                "Staged upload {} reported {} bytes but contains {}",
                blob.filename, blob.size, digest.size
            );
        }

        let target = self.storage.blob_path(&resolved.hash)?;

        if let Some(existing) = resolved.existing {
            debug!("Upload {} dedupes onto node {}", blob.original_name, existing.id);
            self.place_blob(blob, &target).await?;
            return Ok(existing);
        }

        let mime = match &blob.mime_type {
            Some(mime) if !mime.is_empty() => mime.clone(),
            _ => mime_guess::from_path(&resolved.name)
                .first_or_octet_stream()
                .to_string(),
        };

        let new_node = NewNode::file(
            resolved.name,
            resolved.hash,
            digest.digest,
            digest.size,
            mime,
        )
        .with_parent(parent_id);
        let node = NodeRepository::create(&mut tx, &new_node).await?;

        if node.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                &mut tx,
                &node.id,
                node.size,
                SizeDirection::Increment,
            )
            .await?;
        }

        self.place_blob(blob, &target).await?;
        tx.commit().await?;

        info!("Stored file {} ({} bytes) as {}", node.name, node.size, node.id);
        Ok(node)
    }

    /// Move the staged file into place, or drop it if the blob already exists.
    async fn place_blob(&self, blob: &UploadedBlob, target: &std::path::Path) -> Result<()> {
        if self.storage.exists(target).await? {
            self.storage.delete(&blob.path).await?;
        } else {
            self.storage.move_blob(&blob.path, target).await?;
        }
        Ok(())
    }

    /// Create an empty directory.
    pub async fn create_directory(&self, name: &str, parent_id: Option<&str>) -> Result<Node> {
        validate_name(name)?;

        let mut tx = self.db.begin().await?;
        if let Some(parent) = parent_id {
            require_directory(&mut tx, parent).await?;
        }

        let resolved = IdentityResolver::resolve_directory(&mut tx, name, parent_id, None).await?;
        let node = NodeRepository::create(
            &mut tx,
            &NewNode::directory(resolved.name, resolved.hash).with_parent(parent_id),
        )
        .await?;
        tx.commit().await?;

        info!("Created directory {} ({})", node.name, node.id);
        Ok(node)
    }

    /// Rename a node in place.
    ///
    /// Files keep their original extension, and their hash is recomputed from
    /// the stored digest; the blob is relocated under the new hash.
    pub async fn rename(&self, node_id: &str, new_name: &str) -> Result<Node> {
        validate_name(new_name)?;

        let mut tx = self.db.begin().await?;
        let node = require_node(&mut tx, node_id).await?;

        let renamed = match &node.kind {
            NodeKind::File { digest, .. } => {
                let proposed = preserve_extension(&node.name, new_name);
                validate_name(&proposed)?;

                let resolved = IdentityResolver::resolve_file(
                    &mut tx,
                    digest,
                    &proposed,
                    node.parent(),
                    OnExisting::Rename,
                    Some(&node.id),
                )
                .await?;
                if resolved.name == node.name {
                    return Ok(node);
                }

                let renamed = NodeRepository::update(
                    &mut tx,
                    &node.id,
                    &NodeUpdate::new().name(&resolved.name).hash(&resolved.hash),
                )
                .await?
                .ok_or_else(|| CumulusError::FileNotFound(format!("node {}", node.id)))?;

                // The old blob stays readable until the new hash is committed
                let from = self.storage.resolve_path(&node)?;
                let to = self.storage.resolve_path(&renamed)?;
                self.storage.copy_blob(&from, &to).await?;
                renamed
            }
            NodeKind::Directory => {
                let resolved = IdentityResolver::resolve_directory(
                    &mut tx,
                    new_name,
                    node.parent(),
                    Some(&node.id),
                )
                .await?;
                if resolved.name == node.name {
                    return Ok(node);
                }

                NodeRepository::update(
                    &mut tx,
                    &node.id,
                    &NodeUpdate::new().name(&resolved.name).hash(&resolved.hash),
                )
                .await?
                .ok_or_else(|| CumulusError::FileNotFound(format!("node {}", node.id)))?
            }
        };

        tx.commit().await?;
        info!("Renamed {} to {} ({})", node.name, renamed.name, renamed.id);

        if renamed.is_file() && renamed.hash != node.hash {
            retire_blobs(&self.db, self.storage.as_ref(), std::slice::from_ref(&node.hash)).await;
        }
        Ok(renamed)
    }

    /// Delete a file or an empty directory.
    ///
    /// The physical blob is removed only after the database change has
    /// committed, and only once no other node references it. A blob failure
    /// is returned after the commit; the node stays deleted.
    pub async fn delete_node(&self, node_id: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let node = require_node(&mut tx, node_id).await?;

        if node.is_dir() && NodeRepository::count_children(&mut tx, &node.id).await? > 0 {
            return Err(CumulusError::StructuralConflict(format!(
                "directory {} is not empty",
                node.id
            )));
        }

        if node.parent_id.is_some() {
            NodeRepository::propagate_size_to_ancestors(
                &mut tx,
                &node.id,
                node.size,
                SizeDirection::Decrement,
            )
            .await?;
        }
        NodeRepository::delete(&mut tx, &node.id).await?;
        tx.commit().await?;

        info!("Deleted node {} ({})", node.name, node.id);

        if node.is_file() {
            let mut conn = self.db.acquire().await?;
            if NodeRepository::count_by_hash(&mut conn, &node.hash).await? == 0 {
                let path = self.storage.resolve_path(&node)?;
                self.storage.delete(&path).await?;
            }
        }
        Ok(())
    }

    /// Grow a node's size by `delta`.
    ///
    /// Files change only themselves; directories carry the delta up to every
    /// ancestor in one transaction.
    pub async fn increment_size(&self, node_id: &str, delta: u64) -> Result<Node> {
        self.adjust_size(node_id, delta, SizeDirection::Increment)
            .await
    }

    /// Shrink a node's size by `delta`.
    pub async fn decrement_size(&self, node_id: &str, delta: u64) -> Result<Node> {
        self.adjust_size(node_id, delta, SizeDirection::Decrement)
            .await
    }

    async fn adjust_size(
        &self,
        node_id: &str,
        delta: u64,
        direction: SizeDirection,
    ) -> Result<Node> {
        let mut tx = self.db.begin().await?;
        let node = require_node(&mut tx, node_id).await?;

        let changed = match direction {
            SizeDirection::Increment => {
                NodeRepository::increment_size(&mut tx, &node.id, delta).await?
            }
            SizeDirection::Decrement => {
                NodeRepository::decrement_size(&mut tx, &node.id, delta).await?
            }
        };
        if !changed {
            return Err(CumulusError::FileNotFound(format!("node {node_id}")));
        }

        if node.is_dir() {
            NodeRepository::propagate_size_to_ancestors(&mut tx, &node.id, delta, direction)
                .await?;
        }

        let refreshed = require_node(&mut tx, node_id).await?;
        tx.commit().await?;
        Ok(refreshed)
    }
}

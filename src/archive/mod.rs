//! Downloads for Cumulus.
//!
//! A file downloads as its blob; a directory downloads as a tar.gz archive
//! streamed straight from the blobs of its subtree.

mod entries;
mod writer;

pub use entries::{ArchiveEntries, ArchiveEntry};
pub use writer::{write_archive, ArchiveStream, Archiver};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::ArchiveConfig;
use crate::db::Database;
use crate::node::{require_node, NodeRepository};
use crate::storage::BlobStore;
use crate::{CumulusError, Result};

/// Default gzip level for directory archives.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 3;

/// Content type of a directory archive.
pub const ARCHIVE_MIME: &str = "application/gzip";

/// A prepared download.
pub enum Download {
    /// A single file, read from its blob.
    File {
        name: String,
        mime: String,
        size: u64,
        path: PathBuf,
    },
    /// A directory archive that is produced while it is read.
    Archive { name: String, stream: ArchiveStream },
}

impl Download {
    /// File name offered to the client.
    pub fn name(&self) -> &str {
        match self {
            Download::File { name, .. } | Download::Archive { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Download::File { name, size, .. } => f
                .debug_struct("File")
                .field("name", name)
                .field("size", size)
                .finish(),
            Download::Archive { name, .. } => {
                f.debug_struct("Archive").field("name", name).finish()
            }
        }
    }
}

/// Service that resolves nodes into downloads.
#[derive(Clone)]
pub struct DownloadService {
    db: Database,
    storage: Arc<dyn BlobStore>,
    archiver: Archiver,
}

impl DownloadService {
    pub fn new(db: Database, storage: Arc<dyn BlobStore>) -> Self {
        Self {
            db,
            storage,
            archiver: Archiver::default(),
        }
    }

    /// Create a DownloadService from an [`ArchiveConfig`].
    pub fn from_config(db: Database, storage: Arc<dyn BlobStore>, config: &ArchiveConfig) -> Self {
        Self {
            db,
            storage,
            archiver: Archiver::new(config.compression_level),
        }
    }

    /// Resolve `node_id` into a download.
    ///
    /// A missing node or blob is `FileNotFound`. For directories the subtree
    /// is listed up front; blob reads happen as the archive stream is polled.
    pub async fn prepare(&self, node_id: &str) -> Result<Download> {
        let mut conn = self.db.acquire().await?;
        let node = require_node(&mut conn, node_id).await?;

        if node.is_file() {
            let path = self.storage.resolve_path(&node)?;
            if !self.storage.exists(&path).await? {
                return Err(CumulusError::FileNotFound(format!("blob of node {}", node.id)));
            }
            return Ok(Download::File {
                mime: node.mime().to_string(),
                name: node.name,
                size: node.size,
                path,
            });
        }

        let rows = NodeRepository::get_descendants(&mut conn, &node.id).await?;
        drop(conn);

        info!(
            "Streaming archive of {} ({} nodes)",
            node.id,
            rows.len().saturating_sub(1)
        );
        let entries = ArchiveEntries::new(&node.id, rows, self.storage.clone());
        Ok(Download::Archive {
            name: format!("{}.tar.gz", node.name),
            stream: self.archiver.stream(entries),
        })
    }
}

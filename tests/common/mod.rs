//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use cumulus::storage::BlobStore;
use cumulus::{
    CumulusError, Database, DownloadService, LocalStorage, Node, NodeRepository, NodeService,
    NodeTreeService, Result, UploadedBlob,
};

/// Blob store that can be told to fail every delete.
///
/// Also counts how many moves and copies run at once, optionally slowing
/// each one down so that overlap becomes visible.
pub struct FailingStore {
    inner: LocalStorage,
    fail_deletes: AtomicBool,
    transfer_delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: LocalStorage) -> Self {
        Self {
            inner,
            fail_deletes: AtomicBool::new(false),
            transfer_delay_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Hold every move and copy for `delay`, and reset the peak count.
    pub fn slow_transfers(&self, delay: Duration) {
        self.transfer_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self.peak.store(0, Ordering::SeqCst);
    }

    /// Largest number of moves and copies seen in flight together.
    pub fn peak_transfers(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn tracked<F>(&self, transfer: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let delay = self.transfer_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let result = transfer.await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl BlobStore for FailingStore {
    async fn ensure_root(&self) -> Result<PathBuf> {
        self.inner.ensure_root().await
    }

    async fn ensure_tmp(&self) -> Result<PathBuf> {
        self.inner.ensure_tmp().await
    }

    fn tmp(&self) -> &Path {
        self.inner.tmp()
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        self.inner.blob_path(hash)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn move_blob(&self, from: &Path, to: &Path) -> Result<()> {
        self.tracked(self.inner.move_blob(from, to)).await
    }

    async fn copy_blob(&self, from: &Path, to: &Path) -> Result<()> {
        self.tracked(self.inner.copy_blob(from, to)).await
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(CumulusError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only volume",
            )));
        }
        self.inner.delete(path).await
    }
}

/// Database, storage and every service over one temporary directory.
pub struct TestDrive {
    _temp: TempDir,
    pub db: Database,
    pub store: Arc<FailingStore>,
    pub nodes: NodeService,
    pub tree: NodeTreeService,
    pub downloads: DownloadService,
}

impl TestDrive {
    pub async fn new() -> Self {
        Self::with_concurrency(3).await
    }

    pub async fn with_concurrency(concurrency: usize) -> Self {
        let temp = TempDir::new().unwrap();
        let local = LocalStorage::new(temp.path().join("blobs"), temp.path().join("tmp")).unwrap();
        let store = Arc::new(FailingStore::new(local));
        let db = Database::open(temp.path().join("cumulus.db")).await.unwrap();

        Self {
            nodes: NodeService::new(db.clone(), store.clone()),
            tree: NodeTreeService::new(db.clone(), store.clone()).with_concurrency(concurrency),
            downloads: DownloadService::new(db.clone(), store.clone()),
            db,
            store,
            _temp: temp,
        }
    }

    /// Stage `content` in the tmp directory and ingest it.
    pub async fn upload(&self, name: &str, content: &[u8], parent: Option<&str>) -> Node {
        self.try_upload(name, content, parent).await.unwrap()
    }

    pub async fn try_upload(
        &self,
        name: &str,
        content: &[u8],
        parent: Option<&str>,
    ) -> Result<Node> {
        let path = self.stage(content);
        self.nodes
            .process(UploadedBlob::new(path, name, content.len() as u64), parent)
            .await
    }

    pub fn stage(&self, content: &[u8]) -> PathBuf {
        let path = self.store.tmp().join(uuid::Uuid::new_v4().to_string());
        std::fs::write(&path, content).unwrap();
        path
    }

    pub async fn dir(&self, name: &str, parent: Option<&str>) -> Node {
        self.nodes.create_directory(name, parent).await.unwrap()
    }

    pub async fn get(&self, id: &str) -> Node {
        self.nodes.get(id).await.unwrap()
    }

    pub async fn children(&self, id: Option<&str>) -> Vec<Node> {
        self.nodes.list_children(id).await.unwrap()
    }

    pub async fn child_names(&self, id: Option<&str>) -> Vec<String> {
        self.children(id).await.into_iter().map(|n| n.name).collect()
    }

    pub fn blob_of(&self, node: &Node) -> PathBuf {
        self.store.resolve_path(node).unwrap()
    }

    /// Number of blob files on disk.
    pub fn blob_count(&self) -> usize {
        let root = self.store.blob_path("00").unwrap();
        let root = root.parent().and_then(Path::parent).unwrap();
        std::fs::read_dir(root)
            .unwrap()
            .map(|shard| std::fs::read_dir(shard.unwrap().path()).unwrap().count())
            .sum()
    }

    /// Every directory's size equals the sum of its children's sizes.
    pub async fn assert_sizes_consistent(&self) {
        let mut conn = self.db.acquire().await.unwrap();
        let roots = NodeRepository::list_children(&mut conn, None).await.unwrap();
        for root in roots {
            let rows = NodeRepository::get_descendants(&mut conn, &root.id)
                .await
                .unwrap();
            let mut sums: HashMap<String, u64> = HashMap::new();
            for row in &rows {
                if let Some(parent) = &row.node.parent_id {
                    *sums.entry(parent.clone()).or_default() += row.node.size;
                }
            }
            for row in rows.iter().filter(|r| r.node.is_dir()) {
                assert_eq!(
                    row.node.size,
                    sums.get(&row.node.id).copied().unwrap_or(0),
                    "size of directory {}",
                    row.node.name
                );
            }
        }
    }
}

//! Local disk blob storage.
//!
//! Blobs are stored in a sharded directory structure keyed by hash:
//! ```text
//! {root}/
//! ├── ab/
//! │   └── ab12cd34...
//! ├── cd/
//! │   └── cd90ab12...
//! └── ...
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use super::BlobStore;
use crate::config::StorageConfig;
use crate::{CumulusError, Result};

/// Blob storage on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    tmp: PathBuf,
}

impl LocalStorage {
    /// Create a store over `root`, staging uploads in `tmp`.
    ///
    /// Both directories are created if they don't exist.
    pub fn new(root: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let tmp = tmp.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(&tmp)?;

        Ok(Self { root, tmp })
    }

    /// Create a store from a [`StorageConfig`].
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::new(&config.root, &config.tmp)
    }

    /// Get the root path of this storage.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the shard directory name for a hash.
    fn get_shard(hash: &str) -> &str {
        if hash.len() >= 2 {
            &hash[..2]
        } else {
            hash
        }
    }

    fn is_valid_hash(hash: &str) -> bool {
        !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_alphanumeric())
    }

    fn is_contained(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
            && !path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn ensure_root(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        Ok(self.root.clone())
    }

    async fn ensure_tmp(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.tmp).await?;
        Ok(self.tmp.clone())
    }

    fn tmp(&self) -> &Path {
        &self.tmp
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if !Self::is_valid_hash(hash) {
            warn!("Rejected blob lookup for malformed hash");
            return Err(CumulusError::FileNotFound("blob".to_string()));
        }

        let path = self.root.join(Self::get_shard(hash)).join(hash);
        if !self.is_contained(&path) {
            warn!("Rejected blob path outside storage root");
            return Err(CumulusError::FileNotFound("blob".to_string()));
        }
        Ok(path)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }

    async fn move_blob(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::rename(from, to).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CumulusError::FileNotFound("blob".to_string()));
            }
            Err(e) => {
                // Staging and root may live on different filesystems
                debug!("rename failed ({}), falling back to copy", e);
                fs::copy(from, to).await?;
                fs::remove_file(from).await?;
            }
        }
        Ok(())
    }

    async fn copy_blob(&self, from: &Path, to: &Path) -> Result<()> {
        if fs::try_exists(to).await? {
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::copy(from, to).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CumulusError::FileNotFound("blob".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_storage() -> (TempDir, LocalStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage =
            LocalStorage::new(temp_dir.path().join("blobs"), temp_dir.path().join("tmp")).unwrap();
        (temp_dir, storage)
    }

    const HASH: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";

    #[test]
    fn test_new_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("blobs");
        let tmp = temp_dir.path().join("tmp");

        assert!(!root.exists());

        let storage = LocalStorage::new(&root, &tmp).unwrap();

        assert!(root.exists());
        assert!(tmp.exists());
        assert_eq!(storage.root(), root);
        assert_eq!(storage.tmp(), tmp);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (_temp_dir, storage) = setup_storage();
        std::fs::remove_dir_all(storage.root()).unwrap();

        let root = storage.ensure_root().await.unwrap();
        assert!(root.is_dir());
        assert_eq!(storage.ensure_root().await.unwrap(), root);
        assert!(storage.ensure_tmp().await.unwrap().is_dir());
    }

    #[test]
    fn test_blob_path_is_sharded() {
        let (_temp_dir, storage) = setup_storage();

        let path = storage.blob_path(HASH).unwrap();

        assert_eq!(path, storage.root().join("ab").join(HASH));
    }

    #[test]
    fn test_blob_path_rejects_traversal() {
        let (_temp_dir, storage) = setup_storage();

        for hash in ["../../etc/passwd", "..", "ab/../../x", "/etc/passwd", "", "a\\b"] {
            let result = storage.blob_path(hash);
            assert!(
                matches!(result, Err(CumulusError::FileNotFound(_))),
                "{hash:?} was not rejected"
            );
        }
    }

    #[test]
    fn test_rejection_does_not_leak_path() {
        let (_temp_dir, storage) = setup_storage();

        let err = storage.blob_path("../secret").unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("secret"));
        assert!(!message.contains(storage.root().to_string_lossy().as_ref()));
    }

    #[test]
    fn test_get_shard() {
        assert_eq!(LocalStorage::get_shard("abcdef"), "ab");
        assert_eq!(LocalStorage::get_shard("x"), "x");
    }

    #[tokio::test]
    async fn test_move_blob() {
        let (_temp_dir, storage) = setup_storage();
        let staged = storage.tmp().join("upload");
        std::fs::write(&staged, b"Hello, World!").unwrap();

        let target = storage.blob_path(HASH).unwrap();
        storage.move_blob(&staged, &target).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"Hello, World!");
        assert!(storage.exists(&target).await.unwrap());
    }

    #[tokio::test]
    async fn test_move_blob_replaces_existing_target() {
        let (_temp_dir, storage) = setup_storage();
        let target = storage.blob_path(HASH).unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"old").unwrap();

        let staged = storage.tmp().join("upload");
        std::fs::write(&staged, b"new").unwrap();
        storage.move_blob(&staged, &target).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_move_missing_blob() {
        let (_temp_dir, storage) = setup_storage();
        let target = storage.blob_path(HASH).unwrap();

        let result = storage
            .move_blob(&storage.tmp().join("missing"), &target)
            .await;
        assert!(matches!(result, Err(CumulusError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_copy_blob_keeps_source() {
        let (_temp_dir, storage) = setup_storage();
        let source = storage.blob_path(HASH).unwrap();
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"data").unwrap();

        let target = storage.blob_path("cd34").unwrap();
        storage.copy_blob(&source, &target).await.unwrap();

        assert_eq!(std::fs::read(&source).unwrap(), b"data");
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_copy_blob_skips_existing_target() {
        let (_temp_dir, storage) = setup_storage();
        let source = storage.tmp().join("a");
        std::fs::write(&source, b"new").unwrap();

        let target = storage.blob_path(HASH).unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"old").unwrap();

        storage.copy_blob(&source, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, storage) = setup_storage();
        let path = storage.tmp().join("to-delete");
        std::fs::write(&path, b"x").unwrap();

        assert!(storage.delete(&path).await.unwrap());
        assert!(!storage.exists(&path).await.unwrap());
        assert!(!storage.delete(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_many_ignores_missing() {
        let (_temp_dir, storage) = setup_storage();
        let a = storage.tmp().join("a");
        let b = storage.tmp().join("b");
        std::fs::write(&a, b"a").unwrap();

        storage
            .delete_many(&[a.clone(), b.clone()])
            .await
            .unwrap();
        assert!(!a.exists());
    }

    #[tokio::test]
    async fn test_delete_many_reports_all_failures() {
        let (_temp_dir, storage) = setup_storage();
        // Removing a directory with remove_file fails
        let dir_a = storage.tmp().join("dir-a");
        let dir_b = storage.tmp().join("dir-b");
        let ok = storage.tmp().join("ok");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();
        std::fs::write(&ok, b"x").unwrap();

        let err = storage
            .delete_many(&[dir_a.clone(), ok.clone(), dir_b.clone()])
            .await
            .unwrap_err();

        match err {
            CumulusError::Storage(e) => {
                let failed: Vec<_> = e.failures.iter().map(|f| f.path.clone()).collect();
                assert_eq!(failed, vec![dir_a, dir_b]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The healthy path was still deleted
        assert!(!ok.exists());
    }

    #[tokio::test]
    async fn test_binary_content_roundtrip() {
        let (_temp_dir, storage) = setup_storage();
        let content: Vec<u8> = (0..=255).collect();
        let staged = storage.tmp().join("bin");
        std::fs::write(&staged, &content).unwrap();

        let target = storage.blob_path(HASH).unwrap();
        storage.move_blob(&staged, &target).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), content);
    }
}

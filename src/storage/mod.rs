//! Physical blob storage for Cumulus.
//!
//! Blobs are immutable once written and keyed by the owning node's hash.
//! The [`BlobStore`] trait isolates the backing store from the tree logic;
//! [`LocalStorage`] keeps blobs on the local disk.

mod local;

pub use local::LocalStorage;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::node::Node;
use crate::{CumulusError, Result};

/// A single failed blob deletion.
#[derive(Debug)]
pub struct BlobFailure {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// Aggregate of every failure in a bulk delete.
#[derive(Debug)]
pub struct DeleteManyError {
    pub failures: Vec<BlobFailure>,
}

impl fmt::Display for DeleteManyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to delete {} blob(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.path.display(), failure.source)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeleteManyError {}

/// Physical blob store.
///
/// Path arguments are absolute paths previously produced by
/// [`BlobStore::blob_path`] or staged under [`BlobStore::tmp`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the blob root if needed and return it.
    async fn ensure_root(&self) -> Result<PathBuf>;

    /// Create the staging directory if needed and return it.
    async fn ensure_tmp(&self) -> Result<PathBuf>;

    /// Staging directory for uploads.
    fn tmp(&self) -> &Path;

    /// Absolute path of the blob stored under `hash`.
    ///
    /// Rejects anything that would resolve outside the root with
    /// [`CumulusError::FileNotFound`].
    fn blob_path(&self, hash: &str) -> Result<PathBuf>;

    /// Absolute blob path for a file node. Directories have no blob.
    fn resolve_path(&self, node: &Node) -> Result<PathBuf> {
        if node.is_dir() {
            return Err(CumulusError::FileNotFound(format!(
                "directory {} has no blob",
                node.id
            )));
        }
        self.blob_path(&node.hash)
    }

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Move a blob into place. A blob already at `to` is replaced.
    async fn move_blob(&self, from: &Path, to: &Path) -> Result<()>;

    /// Copy a blob. An existing target is left untouched.
    async fn copy_blob(&self, from: &Path, to: &Path) -> Result<()>;

    /// Delete a blob. Returns false if it did not exist.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Delete every path, attempting all of them even if some fail.
    ///
    /// Missing blobs are not failures.
    async fn delete_many(&self, paths: &[PathBuf]) -> Result<()> {
        let results =
            futures::future::join_all(paths.iter().map(|path| async move {
                (path, self.delete(path).await)
            }))
            .await;

        let failures: Vec<BlobFailure> = results
            .into_iter()
            .filter_map(|(path, result)| match result {
                Ok(_) => None,
                Err(CumulusError::Io(source)) => Some(BlobFailure {
                    path: path.clone(),
                    source,
                }),
                Err(e) => Some(BlobFailure {
                    path: path.clone(),
                    source: std::io::Error::other(e.to_string()),
                }),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeleteManyError { failures }.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_many_error_lists_every_path() {
        let err = DeleteManyError {
            failures: vec![
                BlobFailure {
                    path: PathBuf::from("/blobs/ab/abc"),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                },
                BlobFailure {
                    path: PathBuf::from("/blobs/cd/cde"),
                    source: std::io::Error::other("busy"),
                },
            ],
        };

        let message = err.to_string();
        assert!(message.starts_with("failed to delete 2 blob(s)"));
        assert!(message.contains("/blobs/ab/abc: denied"));
        assert!(message.contains("/blobs/cd/cde: busy"));

        let wrapped: CumulusError = err.into();
        assert_eq!(wrapped.kind(), crate::ErrorKind::Internal);
    }
}

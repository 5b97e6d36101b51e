//! Node tree for Cumulus.
//!
//! This module provides the file/directory tree:
//! - Node types and the storage row mapping
//! - Identity (content hash) and name-conflict resolution
//! - Repository with recursive ancestor/descendant traversal
//! - Upload ingestion and size maintenance
//! - Subtree copy, move and delete

pub mod identity;
mod repository;
mod service;
mod tree;
mod types;

pub use identity::{
    build_conflict_pattern, compute_identity, directory_hash, file_hash, get_next_name,
    preserve_extension, split_name, validate_name, BlobDigest, IdentityResolver, OnExisting,
    ResolvedIdentity, MAX_NAME_LENGTH,
};
pub use repository::NodeRepository;
pub(crate) use service::require_node;
pub use service::{NodeService, UploadedBlob};
pub use tree::{NodeTreeService, TransferMode, TransferOptions};
pub use types::{NewNode, Node, NodeKind, NodeUpdate, SizeDirection, TreeRow};

/// Mime sentinel for directories.
pub const DIRECTORY_MIME: &str = "inode/directory";

/// Default number of concurrent file transfers in a subtree operation.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 5;

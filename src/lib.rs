//! Cumulus - content-addressed node tree and storage engine for a cloud drive.
//!
//! Files and directories live in a SQLite-backed tree; file bytes are stored
//! as immutable blobs keyed by a location-salted content hash.

pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod node;
pub mod storage;
pub mod web;

pub use archive::{Archiver, Download, DownloadService};
pub use config::Config;
pub use db::Database;
pub use error::{CumulusError, ErrorKind, Result};
pub use node::{
    Node, NodeKind, NodeRepository, NodeService, NodeTreeService, TransferMode, TransferOptions,
    UploadedBlob,
};
pub use storage::{BlobStore, DeleteManyError, LocalStorage};

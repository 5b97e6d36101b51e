//! Identity and name-conflict resolution.
//!
//! A node's hash embeds its logical location (`parent/name`), so identical
//! bytes stored at the same location dedupe while the same bytes anywhere
//! else get a distinct blob. Everything that derives a hash goes through this
//! module; callers never salt or hash on their own.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use tokio::io::AsyncReadExt;

use super::repository::NodeRepository;
use super::types::Node;
use crate::{CumulusError, Result};

/// Maximum length for a node name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What to do when the resolved hash already exists under the target parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExisting {
    /// Hand back the existing node (upload dedupe).
    Reuse,
    /// Always produce a fresh name; an exact name collision gets a suffix.
    Rename,
}

/// Outcome of identity resolution.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// Final, collision-free name.
    pub name: String,
    /// Hash under the final name.
    pub hash: String,
    /// Existing node with the same hash under the same parent (only with [`OnExisting::Reuse`]).
    pub existing: Option<Node>,
}

/// Digest of a blob's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDigest {
    /// Lowercase hex SHA-256.
    pub digest: String,
    /// Number of bytes read.
    pub size: u64,
}

/// The logical key a hash is salted with: `parent/name`, or bare `name` at the root.
pub fn compute_identity(name: &str, parent_id: Option<&str>) -> String {
    match parent_id {
        Some(parent) => format!("{parent}/{name}"),
        None => name.to_string(),
    }
}

/// Hash of a file stored under `identity_key`, given its content digest.
pub fn file_hash(digest: &str, identity_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(digest.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Synthetic hash for a directory; never used to look up a blob.
pub fn directory_hash(identity_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"dir");
    hasher.update([0u8]);
    hasher.update(identity_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stream a file from disk and compute its content digest.
pub async fn digest_file(path: &Path) -> Result<BlobDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(BlobDigest {
        digest: format!("{:x}", hasher.finalize()),
        size,
    })
}

/// Split a name into base and extension (the extension keeps its dot).
///
/// A leading dot does not start an extension: `.env` has no extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Re-append the original extension when a proposed file name drops or changes it.
pub fn preserve_extension(original: &str, proposed: &str) -> String {
    let (_, original_ext) = split_name(original);
    if original_ext.is_empty() {
        return proposed.to_string();
    }

    let (_, proposed_ext) = split_name(proposed);
    if proposed_ext.eq_ignore_ascii_case(original_ext) {
        proposed.to_string()
    } else {
        format!("{proposed}{original_ext}")
    }
}

/// Reject names that cannot be stored as a single path segment.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CumulusError::Validation("name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(CumulusError::Validation(format!("invalid name: {name}")));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(CumulusError::Validation(
            "name must not contain path separators".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(CumulusError::Validation(format!(
            "name must be at most {MAX_NAME_LENGTH} bytes"
        )));
    }
    Ok(())
}

/// Case-insensitive matcher for `name` and its `base (N)ext` variants.
pub fn build_conflict_pattern(name: &str) -> Result<Regex> {
    let (base, ext) = split_name(name);
    let pattern = format!(
        r"(?i)^{}(?: \((\d+)\))?{}$",
        regex::escape(base),
        regex::escape(ext)
    );
    Regex::new(&pattern)
        .map_err(|e| CumulusError::Validation(format!("unusable name {name:?}: {e}")))
}

/// Pick the next free `base (N)ext` name.
///
/// Only an exact, case-insensitive collision with `target` renames; the
/// new suffix is one past the largest suffix among matching names, with the
/// unsuffixed name counting as 0. Base and extension are taken from the
/// colliding existing name. If the largest suffix is already `u64::MAX`, the
/// smallest unused suffix is taken instead.
pub fn get_next_name(target: &str, existing: &[String]) -> Result<String> {
    let wanted = target.to_lowercase();
    let Some(exact) = existing.iter().find(|n| n.to_lowercase() == wanted) else {
        return Ok(target.to_string());
    };

    let pattern = build_conflict_pattern(target)?;
    let taken: HashSet<u64> = existing
        .iter()
        .filter_map(|n| pattern.captures(n))
        .map(|caps| {
            caps.get(1)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0)
        })
        .collect();

    let max_suffix = taken.iter().copied().max().unwrap_or(0);
    let next = match max_suffix.checked_add(1) {
        Some(next) => next,
        None => (1..u64::MAX).find(|n| !taken.contains(n)).ok_or_else(|| {
            CumulusError::Validation(format!("no free name left for {target}"))
        })?,
    };

    let (base, ext) = split_name(exact);
    Ok(format!("{base} ({next}){ext}"))
}

/// Resolves final names and hashes against current sibling state.
pub struct IdentityResolver;

impl IdentityResolver {
    /// Resolve a name for a node under `parent_id`, allocating a suffix on collision.
    async fn resolve_name(
        conn: &mut SqliteConnection,
        name: &str,
        parent_id: Option<&str>,
        exclude_id: Option<&str>,
    ) -> Result<String> {
        if !NodeRepository::find_name_conflict(conn, parent_id, name, exclude_id).await? {
            return Ok(name.to_string());
        }

        let pattern = build_conflict_pattern(name)?;
        let existing =
            NodeRepository::find_conflicting_names(conn, parent_id, &pattern, exclude_id).await?;
        get_next_name(name, &existing)
    }

    /// Resolve a file's final identity from its already-known content digest.
    ///
    /// `exclude_id` lets a node keep (or re-case) its own name.
    pub async fn resolve_file(
        conn: &mut SqliteConnection,
        digest: &str,
        name: &str,
        parent_id: Option<&str>,
        policy: OnExisting,
        exclude_id: Option<&str>,
    ) -> Result<ResolvedIdentity> {
        if policy == OnExisting::Reuse {
            let hash = file_hash(digest, &compute_identity(name, parent_id));
            if let Some(existing) = NodeRepository::find_by_hash(conn, &hash, parent_id).await? {
                return Ok(ResolvedIdentity {
                    name: existing.name.clone(),
                    hash,
                    existing: Some(existing),
                });
            }
        }

        let final_name = Self::resolve_name(conn, name, parent_id, exclude_id).await?;
        let hash = file_hash(digest, &compute_identity(&final_name, parent_id));
        Ok(ResolvedIdentity {
            name: final_name,
            hash,
            existing: None,
        })
    }

    /// Resolve a directory's final name and synthetic hash.
    pub async fn resolve_directory(
        conn: &mut SqliteConnection,
        name: &str,
        parent_id: Option<&str>,
        exclude_id: Option<&str>,
    ) -> Result<ResolvedIdentity> {
        let final_name = Self::resolve_name(conn, name, parent_id, exclude_id).await?;
        let hash = directory_hash(&compute_identity(&final_name, parent_id));
        Ok(ResolvedIdentity {
            name: final_name,
            hash,
            existing: None,
        })
    }

    /// Hash a staged blob and resolve its identity under `parent_id`.
    pub async fn resolve_identity(
        conn: &mut SqliteConnection,
        blob_path: &Path,
        original_name: &str,
        parent_id: Option<&str>,
    ) -> Result<(ResolvedIdentity, BlobDigest)> {
        let digest = digest_file(blob_path).await?;
        let resolved = Self::resolve_file(
            conn,
            &digest.digest,
            original_name,
            parent_id,
            OnExisting::Reuse,
            None,
        )
        .await?;
        Ok((resolved, digest))
    }
}

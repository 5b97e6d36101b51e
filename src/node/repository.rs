//! Node repository for Cumulus.
//!
//! The sole data-access boundary to the `nodes` table. Every method takes the
//! connection to run on, so a caller inside a transaction passes `&mut tx`
//! and none of these methods open a transaction of its own.

use chrono::Utc;
use regex::Regex;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::types::{
    NewNode, Node, NodeKind, NodeRow, NodeUpdate, SizeDirection, TreeRow, TreeRowRaw,
};
use super::DIRECTORY_MIME;
use crate::{CumulusError, Result};

const NODE_COLUMNS: &str =
    "id, parent_id, name, hash, digest, is_dir, size, mime, created_at, updated_at";

const NODE_COLUMNS_N: &str = "n.id, n.parent_id, n.name, n.hash, n.digest, n.is_dir, n.size, \
                              n.mime, n.created_at, n.updated_at";

/// Repository for node operations.
pub struct NodeRepository;

impl NodeRepository {
    /// Create a new node with a freshly generated ID.
    pub async fn create(conn: &mut SqliteConnection, node: &NewNode) -> Result<Node> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let (is_dir, mime, digest) = match &node.kind {
            NodeKind::File { mime, digest } => (false, mime.as_str(), Some(digest.as_str())),
            NodeKind::Directory => (true, DIRECTORY_MIME, None),
        };

        sqlx::query(
            "INSERT INTO nodes (id, parent_id, name, name_key, hash, digest, is_dir, size, mime,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&node.parent_id)
        .bind(&node.name)
        .bind(name_key(&node.name))
        .bind(&node.hash)
        .bind(digest)
        .bind(is_dir)
        .bind(to_db_size(node.size)?)
        .bind(mime)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Self::get_by_id(conn, &id)
            .await?
            .ok_or_else(|| CumulusError::NotFound("node".to_string()))
    }

    /// Get a node by ID.
    pub async fn get_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(Node::try_from).transpose()
    }

    /// Find the node stored under `hash` within a parent scope.
    ///
    /// A `None` parent matches other tree roots.
    pub async fn find_by_hash(
        conn: &mut SqliteConnection,
        hash: &str,
        parent_id: Option<&str>,
    ) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE hash = ? AND parent_id IS ? LIMIT 1"
        ))
        .bind(hash)
        .bind(parent_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(Node::try_from).transpose()
    }

    /// Count the nodes that reference a hash, across all parents.
    pub async fn count_by_hash(conn: &mut SqliteConnection, hash: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE hash = ?")
            .bind(hash)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.0)
    }

    /// List the direct children of a parent (directories first, then by name).
    pub async fn list_children(
        conn: &mut SqliteConnection,
        parent_id: Option<&str>,
    ) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id IS ?
             ORDER BY is_dir DESC, name COLLATE NOCASE, id"
        ))
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(Node::try_from).collect()
    }

    /// Count the direct children of a node.
    pub async fn count_children(conn: &mut SqliteConnection, parent_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE parent_id = ?")
            .bind(parent_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.0)
    }

    /// All sibling names under `parent_id` that match `pattern`.
    ///
    /// SQLite ships without a REGEXP function, so the match runs here over the
    /// sibling names of a single parent. Only called once an exact collision
    /// is known.
    pub async fn find_conflicting_names(
        conn: &mut SqliteConnection,
        parent_id: Option<&str>,
        pattern: &Regex,
        exclude_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let names: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM nodes WHERE parent_id IS ? AND id IS NOT ?")
                .bind(parent_id)
                .bind(exclude_id)
                .fetch_all(&mut *conn)
                .await?;
        Ok(names
            .into_iter()
            .map(|(name,)| name)
            .filter(|n| pattern.is_match(n))
            .collect())
    }

    /// Whether a sibling other than `exclude_id` already uses `name`, ignoring case.
    pub async fn find_name_conflict(
        conn: &mut SqliteConnection,
        parent_id: Option<&str>,
        name: &str,
        exclude_id: Option<&str>,
    ) -> Result<bool> {
        let found: (i64,) = sqlx::query_as(
            "SELECT EXISTS (
                SELECT 1 FROM nodes WHERE parent_id IS ? AND name_key = ? AND id IS NOT ?
            )",
        )
        .bind(parent_id)
        .bind(name_key(name))
        .bind(exclude_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(found.0 > 0)
    }

    /// Update a node.
    ///
    /// Returns the updated node, or None if not found.
    pub async fn update(
        conn: &mut SqliteConnection,
        id: &str,
        update: &NodeUpdate,
    ) -> Result<Option<Node>> {
        if update.is_empty() {
            return Self::get_by_id(conn, id).await;
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE nodes SET ");
        let mut separated = query.separated(", ");

        if let Some(ref name) = update.name {
            separated.push("name = ");
            separated.push_bind_unseparated(name.clone());
            separated.push("name_key = ");
            separated.push_bind_unseparated(name_key(name));
        }
        if let Some(ref hash) = update.hash {
            separated.push("hash = ");
            separated.push_bind_unseparated(hash.clone());
        }
        if let Some(ref parent_id) = update.parent_id {
            separated.push("parent_id = ");
            separated.push_bind_unseparated(parent_id.clone());
        }
        separated.push("updated_at = ");
        separated.push_bind_unseparated(Utc::now());

        query.push(" WHERE id = ");
        query.push_bind(id);

        let result = query.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Self::get_by_id(conn, id).await
    }

    /// Delete a node by ID.
    ///
    /// Returns true if a node was deleted, false if not found.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete nodes in the given order.
    ///
    /// Children must come before their parents.
    pub async fn delete_many(conn: &mut SqliteConnection, ids: &[&str]) -> Result<u64> {
        let mut deleted = 0;
        for id in ids {
            if Self::delete(conn, id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// All ancestors of a node, nearest parent first.
    ///
    /// The node itself is not included; its parent has depth 1.
    pub async fn get_ancestors(conn: &mut SqliteConnection, id: &str) -> Result<Vec<TreeRow>> {
        let rows = sqlx::query_as::<_, TreeRowRaw>(&format!(
            "WITH RECURSIVE ancestors(id, depth) AS (
                SELECT parent_id, 1 FROM nodes WHERE id = ? AND parent_id IS NOT NULL
                UNION ALL
                SELECT n.parent_id, a.depth + 1
                FROM nodes n JOIN ancestors a ON n.id = a.id
                WHERE n.parent_id IS NOT NULL
            )
            SELECT {NODE_COLUMNS_N}, a.depth AS depth
            FROM ancestors a JOIN nodes n ON n.id = a.id
            ORDER BY a.depth"
        ))
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(TreeRow::try_from).collect()
    }

    /// Ancestors walked one row at a time.
    ///
    /// Slow fallback: issues one query per tree level. Same contract as
    /// [`NodeRepository::get_ancestors`]; only for call sites that cannot use
    /// the recursive query.
    pub async fn get_ancestors_slow(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Vec<TreeRow>> {
        let mut ancestors = Vec::new();
        let mut current = Self::get_by_id(conn, id).await?.and_then(|n| n.parent_id);
        let mut depth = 1;

        while let Some(parent_id) = current {
            match Self::get_by_id(conn, &parent_id).await? {
                Some(parent) => {
                    current = parent.parent_id.clone();
                    ancestors.push(TreeRow {
                        node: parent,
                        depth,
                    });
                    depth += 1;
                }
                None => break,
            }
        }

        Ok(ancestors)
    }

    /// The subtree rooted at `id`, ordered by ascending depth.
    ///
    /// The root itself is the first row, at depth 0. Every row's parent
    /// appears before it.
    pub async fn get_descendants(conn: &mut SqliteConnection, id: &str) -> Result<Vec<TreeRow>> {
        let rows = sqlx::query_as::<_, TreeRowRaw>(&format!(
            "WITH RECURSIVE descendants(id, depth) AS (
                SELECT id, 0 FROM nodes WHERE id = ?
                UNION ALL
                SELECT n.id, d.depth + 1
                FROM nodes n JOIN descendants d ON n.parent_id = d.id
            )
            SELECT {NODE_COLUMNS_N}, d.depth AS depth
            FROM descendants d JOIN nodes n ON n.id = d.id
            ORDER BY d.depth, n.is_dir DESC, n.name"
        ))
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(TreeRow::try_from).collect()
    }

    /// Bulk variant of [`NodeRepository::get_descendants`].
    ///
    /// Depth is relative to whichever requested root a row was reached from.
    /// A row reachable from two requested roots appears once per root.
    pub async fn get_descendants_many(
        conn: &mut SqliteConnection,
        ids: &[&str],
    ) -> Result<Vec<TreeRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "WITH RECURSIVE descendants(id, depth) AS (SELECT id, 0 FROM nodes WHERE id IN (",
        );
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        query.push(format!(
            ") UNION ALL
                SELECT n.id, d.depth + 1
                FROM nodes n JOIN descendants d ON n.parent_id = d.id
            )
            SELECT {NODE_COLUMNS_N}, d.depth AS depth
            FROM descendants d JOIN nodes n ON n.id = d.id
            ORDER BY d.depth, n.is_dir DESC, n.name"
        ));

        let rows = query
            .build_query_as::<TreeRowRaw>()
            .fetch_all(&mut *conn)
            .await?;

        rows.into_iter().map(TreeRow::try_from).collect()
    }

    /// Add or subtract `delta` on every ancestor of `id`, in one statement.
    ///
    /// The node's own size is left untouched.
    pub async fn propagate_size_to_ancestors(
        conn: &mut SqliteConnection,
        id: &str,
        delta: u64,
        direction: SizeDirection,
    ) -> Result<u64> {
        if delta == 0 {
            return Ok(0);
        }

        let sql = format!(
            "WITH RECURSIVE ancestors(id) AS (
                SELECT parent_id FROM nodes WHERE id = ? AND parent_id IS NOT NULL
                UNION ALL
                SELECT n.parent_id FROM nodes n JOIN ancestors a ON n.id = a.id
                WHERE n.parent_id IS NOT NULL
            )
            UPDATE nodes SET size = size {} ?, updated_at = ?
            WHERE id IN (SELECT id FROM ancestors)",
            direction.operator()
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(to_db_size(delta)?)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }

    /// Add `delta` to a single node's size.
    pub async fn increment_size(conn: &mut SqliteConnection, id: &str, delta: u64) -> Result<bool> {
        Self::adjust_size(conn, id, delta, SizeDirection::Increment).await
    }

    /// Subtract `delta` from a single node's size.
    pub async fn decrement_size(conn: &mut SqliteConnection, id: &str, delta: u64) -> Result<bool> {
        Self::adjust_size(conn, id, delta, SizeDirection::Decrement).await
    }

    async fn adjust_size(
        conn: &mut SqliteConnection,
        id: &str,
        delta: u64,
        direction: SizeDirection,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE nodes SET size = size {} ?, updated_at = ? WHERE id = ?",
            direction.operator()
        );
        let result = sqlx::query(&sql)
            .bind(to_db_size(delta)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Lookup key for case-insensitive sibling names.
fn name_key(name: &str) -> String {
    name.to_lowercase()
}

fn to_db_size(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| CumulusError::Validation(format!("size {size} is too large")))
}

//! Database schema and migrations for Cumulus.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: node tree
    r#"
-- One row per file or directory. parent_id NULL marks a tree root.
-- Rows are never cascade-deleted: subtree removal enumerates descendants.
CREATE TABLE nodes (
    id          TEXT PRIMARY KEY,
    parent_id   TEXT REFERENCES nodes(id),
    name        TEXT NOT NULL,
    name_key    TEXT NOT NULL,           -- lowercased name for sibling conflict checks
    hash        TEXT NOT NULL,           -- content address (files) / synthetic (directories)
    digest      TEXT,                    -- SHA-256 of file bytes, NULL for directories
    is_dir      INTEGER NOT NULL DEFAULT 0,
    size        INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
    mime        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX idx_nodes_parent ON nodes(parent_id);
CREATE INDEX idx_nodes_hash ON nodes(hash);
"#,
    // v2: sibling lookups by hash
    r#"
CREATE INDEX idx_nodes_hash_parent ON nodes(hash, parent_id);
"#,
    // v3: case-insensitive sibling lookups
    r#"
CREATE INDEX idx_nodes_parent_name_key ON nodes(parent_id, name_key);
"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_not_empty() {
        assert!(!MIGRATIONS.is_empty());
    }

    #[test]
    fn test_nodes_migration_columns() {
        let nodes = MIGRATIONS[0];
        assert!(nodes.contains("CREATE TABLE nodes"));
        assert!(nodes.contains("parent_id"));
        assert!(nodes.contains("digest"));
        assert!(nodes.contains("name_key"));
        assert!(nodes.contains("CHECK (size >= 0)"));
        assert!(!nodes.contains("ON DELETE CASCADE"));
    }
}

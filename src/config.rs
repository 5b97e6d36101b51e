//! Configuration module for Cumulus.

use serde::Deserialize;
use std::path::Path;

use crate::{CumulusError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/cumulus.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding content-addressed blobs.
    #[serde(default = "default_storage_root")]
    pub root: String,
    /// Staging directory for uploads that have not been ingested yet.
    #[serde(default = "default_storage_tmp")]
    pub tmp: String,
}

fn default_storage_root() -> String {
    "data/blobs".to_string()
}

fn default_storage_tmp() -> String {
    "data/tmp".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            tmp: default_storage_tmp(),
        }
    }
}

/// Subtree copy/move configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeConfig {
    /// Maximum number of file transfers in flight during a subtree copy or move.
    #[serde(default = "default_tree_concurrency")]
    pub concurrency: usize,
}

fn default_tree_concurrency() -> usize {
    crate::node::DEFAULT_TRANSFER_CONCURRENCY
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_tree_concurrency(),
        }
    }
}

/// Directory download configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// gzip compression level (0-9).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

fn default_compression_level() -> u32 {
    crate::archive::DEFAULT_COMPRESSION_LEVEL
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/cumulus.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Subtree operation configuration.
    #[serde(default)]
    pub tree: TreeConfig,
    /// Archive download configuration.
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(CumulusError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CumulusError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `CUMULUS_DATABASE_PATH`: SQLite database file
    /// - `CUMULUS_STORAGE_ROOT`: blob root directory
    /// - `CUMULUS_STORAGE_TMP`: upload staging directory
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_env("CUMULUS_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(root) = non_empty_env("CUMULUS_STORAGE_ROOT") {
            self.storage.root = root;
        }
        if let Some(tmp) = non_empty_env("CUMULUS_STORAGE_TMP") {
            self.storage.tmp = tmp;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tree.concurrency == 0 {
            return Err(CumulusError::Config(
                "tree.concurrency must be at least 1".to_string(),
            ));
        }
        if self.archive.compression_level > 9 {
            return Err(CumulusError::Config(format!(
                "archive.compression_level must be between 0 and 9 (got {})",
                self.archive.compression_level
            )));
        }
        if Path::new(&self.storage.root) == Path::new(&self.storage.tmp) {
            return Err(CumulusError::Config(
                "storage.root and storage.tmp must be different directories".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

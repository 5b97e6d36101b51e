//! Error types for Cumulus.

use thiserror::Error;

use crate::storage::DeleteManyError;

/// Common error type for Cumulus.
#[derive(Error, Debug)]
pub enum CumulusError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("database error: {0}")]
    Database(String),

    /// Database connection error.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A node or its physical blob is missing.
    ///
    /// Also returned for rejected path-traversal attempts, so the message never
    /// carries a filesystem path.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Upload ingestion failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Attempted to place a subtree inside itself.
    #[error("structural conflict: {0}")]
    StructuralConflict(String),

    /// One or more physical blob deletions failed.
    #[error(transparent)]
    Storage(#[from] DeleteManyError),

    /// Archive construction failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Error classification exposed to callers above the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    FileNotFound,
    Validation,
    UploadFailure,
    StructuralConflict,
    Internal,
}

impl CumulusError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CumulusError::NotFound(_) => ErrorKind::NotFound,
            CumulusError::FileNotFound(_) => ErrorKind::FileNotFound,
            CumulusError::Validation(_) => ErrorKind::Validation,
            CumulusError::Upload(_) => ErrorKind::UploadFailure,
            CumulusError::StructuralConflict(_) => ErrorKind::StructuralConflict,
            CumulusError::Database(_)
            | CumulusError::DatabaseConnection(_)
            | CumulusError::Io(_)
            | CumulusError::Storage(_)
            | CumulusError::Archive(_)
            | CumulusError::Config(_) => ErrorKind::Internal,
        }
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for CumulusError {
    fn from(e: sqlx::Error) -> Self {
        CumulusError::Database(e.to_string())
    }
}

/// Result type alias for Cumulus operations.
pub type Result<T> = std::result::Result<T, CumulusError>;

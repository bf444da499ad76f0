use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for Diaryx sync engine operations.
#[derive(Debug, Error)]
pub enum DiaryxError {
    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A kind of error representing a failed file read.
    ///
    /// Can occur due to:
    /// - insufficient permissions
    /// - locking/concurrent access
    /// - resource issues
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to be read
        path: PathBuf,
        /// std::io error that caused this error
        source: std::io::Error,
    },

    /// A kind of error representing a failed file write.
    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to file that failed to be written
        path: PathBuf,
        /// std::io error that caused this error
        source: std::io::Error,
    },

    /// An error that occurred while serializing or deserializing YAML frontmatter.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error from the SQLite storage backend.
    #[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An error that occurs when no frontmatter is found in a file.
    #[error("No frontmatter found in '{0}'")]
    NoFrontmatter(PathBuf),

    /// Error from invalid/unparseable frontmatter.
    #[error("Invalid frontmatter structure in '{0}'")]
    InvalidFrontmatter(PathBuf),

    /// Error for when workspace is not found.
    #[error("Workspace not found at '{0}'")]
    WorkspaceNotFound(PathBuf),

    /// When creating a workspace, workspace already exists.
    #[error("Workspace already exists at '{0}'")]
    WorkspaceAlreadyExists(PathBuf),

    /// Error for invalid path structure (e.g. missing parent directory or filename).
    #[error("Invalid path '{path}': {message}")]
    InvalidPath {
        /// Path that is invalid
        path: PathBuf,
        /// Description of what's wrong with the path
        message: String,
    },

    /// CRDT encode/decode/apply failure from the underlying yrs document.
    ///
    /// Covers state vector decode errors, update decode errors, and update
    /// application failures against a yrs [`yrs::Doc`](yrs::Doc).
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// An operation is not supported in the current configuration (e.g. a
    /// storage backend missing a feature, or an unimplemented sync phase).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The underlying transport (WebSocket or otherwise) closed before a
    /// sync session reached a terminal state.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// A peer sent a message that violates the sync wire protocol (bad
    /// framing, unknown message type, or a message sent out of phase).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A received attachment or snapshot failed an integrity check (hash
    /// mismatch, truncated archive).
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// The configured storage backend is unavailable (connection lost,
    /// backend not initialized).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Downloading a workspace snapshot failed.
    #[error("Snapshot download failed: {0}")]
    SnapshotDownloadFailed(String),

    /// A peer's credentials were rejected during the auth phase of the sync
    /// handshake.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),
}

/// Result type alias for Diaryx operations
pub type Result<T> = std::result::Result<T, DiaryxError>;

/// A serializable representation of DiaryxError for IPC boundaries.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&DiaryxError> for SerializableError {
    fn from(err: &DiaryxError) -> Self {
        let kind = match err {
            DiaryxError::Io(_) => "Io",
            DiaryxError::FileRead { .. } => "FileRead",
            DiaryxError::FileWrite { .. } => "FileWrite",
            DiaryxError::Yaml(_) => "Yaml",
            #[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
            DiaryxError::Database(_) => "Database",
            DiaryxError::NoFrontmatter(_) => "NoFrontmatter",
            DiaryxError::InvalidFrontmatter(_) => "InvalidFrontmatter",
            DiaryxError::WorkspaceNotFound(_) => "WorkspaceNotFound",
            DiaryxError::WorkspaceAlreadyExists(_) => "WorkspaceAlreadyExists",
            DiaryxError::InvalidPath { .. } => "InvalidPath",
            DiaryxError::Crdt(_) => "Crdt",
            DiaryxError::Unsupported(_) => "Unsupported",
            DiaryxError::TransportClosed(_) => "TransportClosed",
            DiaryxError::ProtocolViolation(_) => "ProtocolViolation",
            DiaryxError::IntegrityViolation(_) => "IntegrityViolation",
            DiaryxError::StorageUnavailable(_) => "StorageUnavailable",
            DiaryxError::SnapshotDownloadFailed(_) => "SnapshotDownloadFailed",
            DiaryxError::AuthRejected(_) => "AuthRejected",
        }
        .to_string();

        let path = match err {
            DiaryxError::FileRead { path, .. } => Some(path.clone()),
            DiaryxError::FileWrite { path, .. } => Some(path.clone()),
            DiaryxError::NoFrontmatter(path) => Some(path.clone()),
            DiaryxError::InvalidFrontmatter(path) => Some(path.clone()),
            DiaryxError::WorkspaceNotFound(path) => Some(path.clone()),
            DiaryxError::WorkspaceAlreadyExists(path) => Some(path.clone()),
            DiaryxError::InvalidPath { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<DiaryxError> for SerializableError {
    fn from(err: DiaryxError) -> Self {
        SerializableError::from(&err)
    }
}

impl DiaryxError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

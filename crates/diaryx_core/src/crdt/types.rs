//! Core types for CRDT-based synchronization.
//!
//! This module defines the data structures used to represent file metadata,
//! binary attachments, and CRDT updates in the synchronization system.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use ts_rs::TS;

/// Deserializes a value that should be a string, but may be an integer or other type.
/// Converts non-string values to their string representation.
fn deserialize_string_lenient<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(serde_json::Value::Null) => Ok(None),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {:?}",
            other
        ))),
    }
}

/// Metadata for a file in the workspace CRDT.
///
/// This represents the synchronized state of a file's frontmatter properties,
/// stored as a single JSON-encoded value in a Y.Map within the workspace
/// document. The Y.Map key IS the file's path relative to the workspace
/// root, so renames and moves are represented as a delete-of-the-old-key
/// plus a put-of-the-new-key rather than a stable-ID property update.
///
/// - `filename`: the file's own name component, kept for display even
///   though it is always derivable from the key.
/// - `parent`: path of the parent index file, or `None` for root files.
/// - `children`: paths of child files, in display order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FileMetadata {
    /// Filename on disk (e.g. "my-note.md").
    #[serde(default)]
    pub filename: String,

    /// Display title from frontmatter
    #[serde(default, deserialize_with = "deserialize_string_lenient")]
    pub title: Option<String>,

    /// Path of the parent index file, or `None` for root files.
    pub parent: Option<String>,

    /// Paths of child files, in display order.
    pub children: Option<Vec<String>>,

    /// Binary attachment references
    pub attachments: Vec<BinaryRef>,

    /// Soft deletion tombstone - if true, file is considered deleted
    pub deleted: bool,

    /// Visibility/access control tags
    pub audience: Option<Vec<String>>,

    /// File description from frontmatter
    #[serde(default, deserialize_with = "deserialize_string_lenient")]
    pub description: Option<String>,

    /// Additional frontmatter properties not covered by other fields
    pub extra: HashMap<String, serde_json::Value>,

    /// Unix timestamp of last modification (milliseconds)
    pub modified_at: i64,
}

impl FileMetadata {
    /// Create new FileMetadata with the given title
    pub fn new(title: Option<String>) -> Self {
        Self {
            title,
            modified_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Create new FileMetadata with filename and title
    pub fn with_filename(filename: String, title: Option<String>) -> Self {
        Self {
            filename,
            title,
            modified_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Mark this file as deleted (soft delete)
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.modified_at = chrono::Utc::now().timestamp_millis();
    }

    /// Check if this file is an index (has children)
    pub fn is_index(&self) -> bool {
        self.children.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Convert a title to a normalized filename.
    ///
    /// Rules:
    /// - Lowercase
    /// - Replace spaces and underscores with hyphens
    /// - Remove non-alphanumeric characters (except hyphens)
    /// - Collapse multiple hyphens
    /// - Append .md extension
    ///
    /// Example: "My Note Title" → "my-note-title.md"
    pub fn normalize_title_to_filename(title: &str) -> String {
        let normalized: String = title
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() {
                    c
                } else if c == ' ' || c == '_' {
                    '-'
                } else if c == '-' {
                    c
                } else {
                    // Skip other characters
                    '-'
                }
            })
            .collect();

        // Collapse multiple hyphens and trim leading/trailing hyphens
        let collapsed: String = normalized
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");

        if collapsed.is_empty() {
            "untitled.md".to_string()
        } else {
            format!("{}.md", collapsed)
        }
    }
}

/// Reference to a binary attachment file.
///
/// Binary files (images, PDFs, etc.) are stored separately from the CRDT,
/// with only their metadata tracked in the synchronization system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BinaryRef {
    /// Relative path within workspace (e.g. "_attachments/image.png")
    pub path: String,

    /// Source of the binary: "local", "pending", or external URL
    pub source: String,

    /// SHA-256 hash for deduplication and integrity
    pub hash: String,

    /// MIME type (e.g. "image/png")
    pub mime_type: String,

    /// File size in bytes
    pub size: u64,

    /// Unix timestamp when uploaded (milliseconds)
    pub uploaded_at: Option<i64>,

    /// Soft deletion tombstone
    pub deleted: bool,
}

impl BinaryRef {
    /// Create a new local binary reference
    pub fn new_local(path: String, hash: String, mime_type: String, size: u64) -> Self {
        Self {
            path,
            source: "local".to_string(),
            hash,
            mime_type,
            size,
            uploaded_at: Some(chrono::Utc::now().timestamp_millis()),
            deleted: false,
        }
    }

    /// Create a pending binary reference (not yet uploaded)
    pub fn new_pending(path: String, mime_type: String, size: u64) -> Self {
        Self {
            path,
            source: "pending".to_string(),
            hash: String::new(),
            mime_type,
            size,
            uploaded_at: None,
            deleted: false,
        }
    }

    /// Mark this attachment as deleted (soft delete / tombstone).
    ///
    /// Attachment identity is the content hash, so replacing an attachment
    /// at the same path with different bytes tombstones the old hash entry
    /// rather than mutating it in place.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

/// A CRDT update record, stored for history and sync purposes.
#[derive(Debug, Clone)]
pub struct CrdtUpdate {
    /// Unique identifier for this update
    pub update_id: i64,

    /// Name of the document this update belongs to
    pub doc_name: String,

    /// Binary yrs update data
    pub data: Vec<u8>,

    /// Unix timestamp when this update was created (milliseconds)
    pub timestamp: i64,

    /// Origin of this update (local edit, remote sync, etc.)
    pub origin: UpdateOrigin,

    /// Device ID that created this update (for multi-device attribution)
    pub device_id: Option<String>,

    /// Human-readable device name (e.g. "MacBook Pro", "iPhone")
    pub device_name: Option<String>,
}

/// Origin of a CRDT update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update from initial sync handshake
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

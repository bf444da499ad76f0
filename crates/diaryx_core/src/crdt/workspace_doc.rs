//! Workspace CRDT document for synchronizing file hierarchy.
//!
//! This module provides [`WorkspaceCrdt`], which wraps a yrs [`Doc`] to manage
//! the workspace's file hierarchy as a conflict-free replicated data type.
//!
//! # Path-Keyed Architecture
//!
//! Files are keyed directly by their path relative to the workspace root.
//! Each entry's value is the whole [`FileMetadata`] record minus `children`,
//! JSON-encoded and stored as a single Y.Map value - this gives last-write-wins
//! semantics at record granularity for scalar fields. `children` is carved out
//! into its own nested Y.Array per parent path so that concurrent inserts from
//! offline devices both survive the merge instead of one clobbering the
//! other's whole-record write.
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "files"
//! │   ├── "index.md" → FileMetadata { filename: "index.md", parent: None, children: None, ... }
//! │   ├── "daily.md" → FileMetadata { filename: "daily.md", parent: Some("index.md"), ... }
//! │   └── ...
//! └── Y.Map "children"
//!     └── "index.md" → Y.Array ["daily.md"]
//! ```
//!
//! [`WorkspaceCrdt::get_file`] overlays the live array back onto
//! `FileMetadata::children` on read, so callers never see the split.
//!
//! Because the key IS the path, a rename or move is represented as removing
//! the old key and inserting a new one - see [`WorkspaceCrdt::rename`] and
//! [`WorkspaceCrdt::move_to`], which also repair the parent's `children` list
//! so the tree stays internally consistent.
//!
//! # Synchronization
//!
//! The workspace CRDT supports the Y-sync protocol for synchronization with
//! peers. Use [`WorkspaceCrdt::encode_state_vector`] and
//! [`WorkspaceCrdt::encode_state_as_update`] for the sync handshake, and
//! [`WorkspaceCrdt::apply_update`] to integrate remote changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Array, ArrayPrelim, ArrayRef, Doc, Map, MapRef, Observable, ReadTxn, StateVector, Transact,
    Update,
};

use super::events::FileSystemEvent;
use super::storage::{CrdtStorage, StorageResult};
use super::types::{CrdtUpdate, FileMetadata, UpdateOrigin};
use crate::error::DiaryxError;

/// The name of the Y.Map containing file metadata.
const FILES_MAP_NAME: &str = "files";

/// The name of the Y.Map holding one nested Y.Array of child paths per
/// parent path - the real ordered-list CRDT backing `children`.
const CHILDREN_MAP_NAME: &str = "children";

/// Depth/ancestor-chain guard for [`WorkspaceCrdt::build_tree`]. `children`
/// is only a DAG by convention - a corrupt or adversarial merge could still
/// produce a cycle, and this bounds the walk instead of looping forever.
const MAX_TREE_DEPTH: usize = 256;

/// The document name used for workspace storage.
const WORKSPACE_DOC_NAME: &str = "workspace";

/// A node in the tree produced by [`WorkspaceCrdt::build_tree`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeNode {
    /// Path of the file this node represents.
    pub path: String,
    /// Direct children, in their CRDT-merged order.
    pub children: Vec<TreeNode>,
}

/// A CRDT document representing the workspace file hierarchy.
///
/// This wraps a yrs [`Doc`] and provides methods for managing file metadata
/// in a conflict-free manner across multiple clients.
pub struct WorkspaceCrdt {
    /// The underlying yrs document
    doc: Doc,

    /// Reference to the files map (cached for efficiency)
    files_map: MapRef,

    /// Reference to the per-parent children-array map (cached for efficiency)
    children_map: MapRef,

    /// Storage backend for persistence
    storage: Arc<dyn CrdtStorage>,

    /// Document name for storage operations
    doc_name: String,

    /// Optional callback for emitting filesystem events on remote/sync updates.
    /// This enables unified event handling for both local and remote changes.
    event_callback: Option<Arc<dyn Fn(&FileSystemEvent) + Send + Sync>>,
}

impl WorkspaceCrdt {
    /// Create a new empty workspace CRDT with the given storage backend.
    pub fn new(storage: Arc<dyn CrdtStorage>) -> Self {
        Self::with_name(storage, WORKSPACE_DOC_NAME.to_string())
    }

    /// Create a new workspace CRDT with a custom document name.
    pub fn with_name(storage: Arc<dyn CrdtStorage>, doc_name: String) -> Self {
        let doc = Doc::new();
        let files_map = doc.get_or_insert_map(FILES_MAP_NAME);
        let children_map = doc.get_or_insert_map(CHILDREN_MAP_NAME);

        Self {
            doc,
            files_map,
            children_map,
            storage,
            doc_name,
            event_callback: None,
        }
    }

    /// Load an existing workspace CRDT from storage.
    ///
    /// If no document exists in storage, returns a new empty workspace.
    pub fn load(storage: Arc<dyn CrdtStorage>) -> StorageResult<Self> {
        Self::load_with_name(storage, WORKSPACE_DOC_NAME.to_string())
    }

    /// Load a workspace CRDT with a custom document name from storage.
    ///
    /// This loads both the base snapshot (if any) and all incremental updates
    /// to reconstruct the current state.
    pub fn load_with_name(storage: Arc<dyn CrdtStorage>, doc_name: String) -> StorageResult<Self> {
        let doc = Doc::new();

        {
            let mut txn = doc.transact_mut();

            // Try to load base snapshot from storage
            if let Some(state) = storage.load_doc(&doc_name)? {
                let update = Update::decode_v1(&state)
                    .map_err(|e| DiaryxError::Crdt(format!("failed to decode CRDT state: {}", e)))?;
                txn.apply_update(update)
                    .map_err(|e| DiaryxError::Crdt(format!("failed to apply snapshot: {}", e)))?;
            }

            // Apply all incremental updates from storage. This matters when a
            // snapshot hasn't been compacted yet and the log is the source of truth.
            let updates = storage.get_all_updates(&doc_name)?;
            for crdt_update in updates {
                if let Ok(update) = Update::decode_v1(&crdt_update.data) {
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!(
                            "Failed to apply stored update {} for {}: {}",
                            crdt_update.update_id,
                            doc_name,
                            e
                        );
                    }
                }
            }
        }

        let files_map = doc.get_or_insert_map(FILES_MAP_NAME);
        let children_map = doc.get_or_insert_map(CHILDREN_MAP_NAME);

        Ok(Self {
            doc,
            files_map,
            children_map,
            storage,
            doc_name,
            event_callback: None,
        })
    }

    /// Set the event callback for emitting filesystem events on remote/sync updates.
    ///
    /// When set, this callback will be invoked with `FileSystemEvent`s whenever
    /// `apply_update()` is called with a non-Local origin. This enables unified
    /// event handling where the UI responds the same way to both local and remote changes.
    pub fn set_event_callback(&mut self, callback: Arc<dyn Fn(&FileSystemEvent) + Send + Sync>) {
        self.event_callback = Some(callback);
    }

    /// Emit a filesystem event to the registered callback, if any.
    fn emit_event(&self, event: FileSystemEvent) {
        if let Some(ref cb) = self.event_callback {
            cb(&event);
        }
    }

    /// Get the underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Get the document name used for storage.
    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<dyn CrdtStorage> {
        &self.storage
    }

    // ==================== File Operations ====================

    /// Get metadata for a file at the given path.
    ///
    /// `children` is overlaid from the live per-parent Y.Array (see the
    /// module docs) rather than read back from the JSON record, so this
    /// always reflects merges from concurrent `add_child`/`remove_child`
    /// calls on other devices.
    pub fn get_file(&self, path: &str) -> Option<FileMetadata> {
        let txn = self.doc.transact();

        let mut metadata: FileMetadata = self.files_map.get(&txn, path).and_then(|value| {
            let json = value.to_string(&txn);
            serde_json::from_str(&json).ok()
        })?;
        metadata.children = self.read_children(&txn, path);
        Some(metadata)
    }

    /// Set metadata for a file at the given path (the `put` operation).
    ///
    /// This will create a new entry or update an existing one. The change is
    /// automatically recorded in the update history.
    ///
    /// `metadata.children` is only consulted to *seed* the path's children
    /// array the first time the record is created - on every write the
    /// persisted scalar record itself carries no `children`, since that
    /// field's source of truth is the nested array mutated by
    /// [`Self::add_child`]/[`Self::remove_child`]. This keeps a later
    /// unrelated `set_file` (e.g. a title edit) from clobbering children
    /// merged in concurrently from another device.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage.
    pub fn set_file(&self, path: &str, mut metadata: FileMetadata) -> StorageResult<()> {
        // Get state vector before the change
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        let seed_children = metadata.children.take();

        // Make the change
        {
            let mut txn = self.doc.transact_mut();
            let json = serde_json::to_string(&metadata).unwrap_or_default();
            self.files_map.insert(&mut txn, path, json);

            if let Some(seed) = seed_children {
                if self.children_array(&txn, path).is_none() {
                    self.children_map
                        .insert(&mut txn, path, ArrayPrelim::from(dedup_preserve_order(seed)));
                }
            }
        }

        // Capture the incremental update and store it
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };

        if !update.is_empty() {
            self.storage
                .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
        }
        Ok(())
    }

    /// Look up the live children array for `parent_path`, if one has ever
    /// been created (by `set_file`'s initial seed or by `add_child`).
    fn children_array(&self, txn: &impl ReadTxn, parent_path: &str) -> Option<ArrayRef> {
        self.children_map
            .get(txn, parent_path)
            .and_then(|v| v.cast::<ArrayRef>().ok())
    }

    /// Read `parent_path`'s current children, deduped and in array order.
    ///
    /// Returns `None` if no array has ever been created for this path
    /// (distinct from `Some(vec![])`, an array that exists but is currently
    /// empty - `children` is `null` vs. an empty list).
    fn read_children(&self, txn: &impl ReadTxn, parent_path: &str) -> Option<Vec<String>> {
        let array = self.children_array(txn, parent_path)?;
        let items: Vec<String> = array
            .iter(txn)
            .filter_map(|v| v.cast::<String>().ok())
            .collect();
        Some(dedup_preserve_order(items))
    }

    /// Get-or-create the children array for `parent_path` within an
    /// in-progress transaction.
    fn children_array_mut(&self, txn: &mut yrs::TransactionMut, parent_path: &str) -> ArrayRef {
        if let Some(existing) = self.children_array(txn, parent_path) {
            existing
        } else {
            self.children_map
                .insert(txn, parent_path, ArrayPrelim::from(Vec::<String>::new()))
        }
    }

    /// Mark a file as deleted (soft delete / tombstone).
    ///
    /// This sets the `deleted` flag to true rather than removing the entry,
    /// which is important for proper CRDT tombstone handling: a concurrent
    /// edit to the same path on another device will still see the record and
    /// can choose to restore it.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage.
    pub fn tombstone(&self, path: &str) -> StorageResult<()> {
        if let Some(mut metadata) = self.get_file(path) {
            metadata.mark_deleted();
            self.set_file(path, metadata)?;
        }
        Ok(())
    }

    /// Restore a previously tombstoned file.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage.
    pub fn restore(&self, path: &str) -> StorageResult<()> {
        if let Some(mut metadata) = self.get_file(path) {
            metadata.deleted = false;
            metadata.modified_at = chrono::Utc::now().timestamp_millis();
            self.set_file(path, metadata)?;
        }
        Ok(())
    }

    /// Deprecated alias for [`WorkspaceCrdt::tombstone`].
    pub fn delete_file(&self, path: &str) -> StorageResult<()> {
        self.tombstone(path)
    }

    /// Remove a file entry completely from the CRDT.
    ///
    /// **Warning**: This should generally not be used. Prefer [`Self::tombstone`]
    /// for proper tombstone handling. Use this only for garbage collection
    /// of very old deleted entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage.
    pub fn remove_file(&self, path: &str) -> StorageResult<()> {
        // Get state vector before the change
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        // Make the change
        {
            let mut txn = self.doc.transact_mut();
            self.files_map.remove(&mut txn, path);
        }

        // Capture the incremental update and store it
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };

        if !update.is_empty() {
            self.storage
                .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
        }
        Ok(())
    }

    /// List all files in the workspace.
    ///
    /// Returns a vector of (path, metadata) tuples for all files,
    /// including deleted ones (check `metadata.deleted`).
    pub fn list_files(&self) -> Vec<(String, FileMetadata)> {
        let txn = self.doc.transact();

        self.files_map
            .iter(&txn)
            .filter_map(|(key, value)| {
                let path = key.to_string();
                let json = value.to_string(&txn);
                let mut metadata: FileMetadata = serde_json::from_str(&json).ok()?;
                metadata.children = self.read_children(&txn, &path);
                Some((path, metadata))
            })
            .collect()
    }

    /// List all non-deleted files in the workspace.
    pub fn list_active_files(&self) -> Vec<(String, FileMetadata)> {
        self.list_files()
            .into_iter()
            .filter(|(_, meta)| !meta.deleted)
            .collect()
    }

    /// Get the number of files in the workspace (including deleted).
    pub fn file_count(&self) -> usize {
        let txn = self.doc.transact();
        self.files_map.len(&txn) as usize
    }

    // ==================== Hierarchy Operations ====================

    /// Add `child_path` to the `children` list of `parent_path`, if not already present.
    ///
    /// This mutates `parent_path`'s nested Y.Array directly rather than
    /// rewriting the whole `FileMetadata` record, so a concurrent `add_child`
    /// for a different child on another device merges as two surviving
    /// inserts instead of a last-write-wins record clobber.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage, or if
    /// `parent_path` has no entry yet.
    pub fn add_child(&self, parent_path: &str, child_path: &str) -> StorageResult<()> {
        if self.get_file(parent_path).is_none() {
            return Ok(());
        }

        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            let array = self.children_array_mut(&mut txn, parent_path);
            let already_present = array
                .iter(&txn)
                .any(|v| v.cast::<String>().map(|s| s == child_path).unwrap_or(false));
            if !already_present {
                array.push_back(&mut txn, child_path.to_string());
            }
        }

        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };
        if !update.is_empty() {
            self.storage
                .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
        }
        Ok(())
    }

    /// Remove `child_path` from the `children` list of `parent_path`.
    ///
    /// This tombstones the matching entry in the nested Y.Array - a
    /// concurrent insert of a different child on another device is an
    /// independent operation and is unaffected by the removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage.
    pub fn remove_child(&self, parent_path: &str, child_path: &str) -> StorageResult<()> {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        let removed = {
            let mut txn = self.doc.transact_mut();
            match self.children_array(&txn, parent_path) {
                Some(array) => {
                    let index = array
                        .iter(&txn)
                        .position(|v| v.cast::<String>().map(|s| s == child_path).unwrap_or(false));
                    if let Some(index) = index {
                        array.remove(&mut txn, index as u32);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if removed {
            let update = {
                let txn = self.doc.transact();
                txn.encode_state_as_update_v1(&sv_before)
            };
            if !update.is_empty() {
                self.storage
                    .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
            }
        }
        Ok(())
    }

    /// Migrate `old_path`'s children array to live under `new_path`, used by
    /// [`Self::rename`]/[`Self::move_to`] when the moved record is itself a
    /// parent. The Y.Map key is the path, so a path change otherwise orphans
    /// the old key's array.
    fn migrate_children_key(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        if old_path == new_path {
            return Ok(());
        }

        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        let migrated = {
            let mut txn = self.doc.transact_mut();
            match self.children_array(&txn, old_path) {
                Some(array) => {
                    let items: Vec<String> = array
                        .iter(&txn)
                        .filter_map(|v| v.cast::<String>().ok())
                        .collect();
                    self.children_map.remove(&mut txn, old_path);
                    self.children_map
                        .insert(&mut txn, new_path, ArrayPrelim::from(items));
                    true
                }
                None => false,
            }
        };

        if migrated {
            let update = {
                let txn = self.doc.transact();
                txn.encode_state_as_update_v1(&sv_before)
            };
            if !update.is_empty() {
                self.storage
                    .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
            }
        }
        Ok(())
    }

    /// Rename a file, keeping the same parent.
    ///
    /// Since the Y.Map key is the path itself, this removes the old entry and
    /// inserts a new one under `new_path`, updating `filename` and repairing
    /// the parent's `children` list to reference the new path.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage, or if
    /// `old_path` has no entry.
    pub fn rename(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        let Some(mut meta) = self.get_file(old_path) else {
            return Ok(());
        };

        let new_filename = std::path::Path::new(new_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(new_path)
            .to_string();
        meta.filename = new_filename;
        meta.modified_at = chrono::Utc::now().timestamp_millis();

        let parent = meta.parent.clone();
        // `children` is migrated separately below - don't let set_file reseed it.
        meta.children = None;

        self.remove_file(old_path)?;
        self.set_file(new_path, meta)?;
        self.migrate_children_key(old_path, new_path)?;

        if let Some(parent_path) = parent {
            self.remove_child(&parent_path, old_path)?;
            self.add_child(&parent_path, new_path)?;
        }

        Ok(())
    }

    /// Move a file to a new parent, keeping its filename.
    ///
    /// The new path is computed by joining the new parent's directory with
    /// the file's existing filename. Updates `parent` on the moved record and
    /// repairs `children` on both the old and new parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails to persist to storage, or if
    /// `path` has no entry.
    pub fn move_to(&self, path: &str, new_parent_path: Option<&str>) -> StorageResult<String> {
        let Some(mut meta) = self.get_file(path) else {
            return Ok(path.to_string());
        };

        let old_parent = meta.parent.clone();
        let filename = meta.filename.clone();

        let new_path = match new_parent_path {
            Some(parent) => {
                let parent_dir = std::path::Path::new(parent)
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new(""));
                parent_dir.join(&filename).to_string_lossy().to_string()
            }
            None => filename.clone(),
        };

        meta.parent = new_parent_path.map(String::from);
        meta.modified_at = chrono::Utc::now().timestamp_millis();
        // `children` is migrated separately below - don't let set_file reseed it.
        meta.children = None;

        if new_path != path {
            self.remove_file(path)?;
        }
        self.set_file(&new_path, meta)?;
        self.migrate_children_key(path, &new_path)?;

        if let Some(old) = old_parent {
            self.remove_child(&old, path)?;
        }
        if let Some(new_parent) = new_parent_path {
            self.add_child(new_parent, &new_path)?;
        }

        Ok(new_path)
    }

    /// Deprecated alias for [`WorkspaceCrdt::rename`] matching the old filename-only signature.
    pub fn rename_file(&self, path: &str, new_filename: &str) -> StorageResult<()> {
        let new_path = match std::path::Path::new(path).parent() {
            Some(dir) if dir != std::path::Path::new("") => {
                dir.join(new_filename).to_string_lossy().to_string()
            }
            _ => new_filename.to_string(),
        };
        self.rename(path, &new_path)
    }

    /// Deprecated alias for [`WorkspaceCrdt::move_to`].
    pub fn move_file(&self, path: &str, new_parent: Option<&str>) -> StorageResult<()> {
        self.move_to(path, new_parent).map(|_| ())
    }

    /// Build the file tree, walking `children` from the workspace root.
    ///
    /// The root is the unique non-tombstoned record with `children ≠ null`
    /// and `parent = null`. Returns `None` if no such record exists. If more
    /// than one candidate qualifies, the lexicographically smallest path is
    /// used and the rest are logged as a warning - this keeps the result
    /// deterministic (and thus identical across clients) rather than picking
    /// arbitrarily.
    ///
    /// Descent is guarded against cycles: a path that reappears in its own
    /// ancestor chain, or a chain deeper than [`MAX_TREE_DEPTH`], is logged as
    /// a warning and its subtree is cut short rather than looping forever.
    /// `children` forms a DAG by convention, not by construction, so a
    /// corrupted or adversarial merge must not be able to hang the walk.
    pub fn build_tree(&self) -> Option<TreeNode> {
        let mut roots: Vec<String> = self
            .list_active_files()
            .into_iter()
            .filter(|(_, meta)| meta.parent.is_none() && meta.children.is_some())
            .map(|(path, _)| path)
            .collect();
        roots.sort();

        let root_path = roots.first()?.clone();
        if roots.len() > 1 {
            log::warn!(
                "multiple workspace root candidates {:?}; using {:?}",
                roots,
                root_path
            );
        }

        let mut ancestors = Vec::new();
        Some(self.build_subtree(&root_path, &mut ancestors, 0))
    }

    /// Recursive worker for [`Self::build_tree`]. `ancestors` is the chain of
    /// paths currently being descended, used to detect cycles.
    fn build_subtree(&self, path: &str, ancestors: &mut Vec<String>, depth: usize) -> TreeNode {
        if depth >= MAX_TREE_DEPTH || ancestors.iter().any(|a| a == path) {
            log::warn!(
                "cycle or excessive depth in workspace tree at {:?} (ancestors: {:?})",
                path,
                ancestors
            );
            return TreeNode {
                path: path.to_string(),
                children: Vec::new(),
            };
        }

        ancestors.push(path.to_string());
        let children = self
            .get_file(path)
            .and_then(|meta| meta.children)
            .unwrap_or_default()
            .into_iter()
            .filter(|child_path| {
                self.get_file(child_path)
                    .map(|meta| !meta.deleted)
                    .unwrap_or(false)
            })
            .map(|child_path| self.build_subtree(&child_path, ancestors, depth + 1))
            .collect();
        ancestors.pop();

        TreeNode {
            path: path.to_string(),
            children,
        }
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync handshake.
    ///
    /// Send this to a remote peer to initiate synchronization.
    /// The remote peer will use it to compute what updates you're missing.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    ///
    /// This returns a binary blob that can be applied to another document
    /// to bring it up to date with this one.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only the updates that the remote peer is missing.
    ///
    /// Given the remote peer's state vector, this computes and returns
    /// only the updates they don't have yet.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DiaryxError::Crdt(format!("failed to decode state vector: {}", e)))?;

        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a remote peer.
    ///
    /// Returns the update ID if the update was persisted to storage.
    ///
    /// For non-Local origins (Remote, Sync), this method will detect what changed
    /// and emit corresponding `FileSystemEvent`s via the event callback. This enables
    /// unified event handling where the UI responds the same way to both local and
    /// remote changes.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<Option<i64>> {
        let should_emit = origin != UpdateOrigin::Local && self.event_callback.is_some();

        let files_before: HashMap<String, FileMetadata> = if should_emit {
            self.list_files().into_iter().collect()
        } else {
            HashMap::new()
        };

        let decoded = Update::decode_v1(update)
            .map_err(|e| DiaryxError::Crdt(format!("failed to decode update: {}", e)))?;

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DiaryxError::Crdt(format!("failed to apply update: {}", e)))?;
        }

        if should_emit {
            let files_after: HashMap<String, FileMetadata> =
                self.list_files().into_iter().collect();
            let renames = detect_renames(&files_before, &files_after);
            self.emit_diff_events(&files_before, &files_after, &renames);
        }

        let update_id = self.storage.append_update(&self.doc_name, update, origin)?;
        Ok(Some(update_id))
    }

    /// Apply an update from a remote peer and return the list of changed file paths.
    ///
    /// This is like `apply_update` but returns the paths of files that changed,
    /// allowing callers to selectively write those files to disk.
    ///
    /// Returns (update_id, changed_paths, renames) where:
    /// - changed_paths includes newly created, deleted, and modified files
    /// - renames is a list of (old_path, new_path) pairs for detected renames
    pub fn apply_update_tracking_changes(
        &self,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> StorageResult<(Option<i64>, Vec<String>, Vec<(String, String)>)> {
        let files_before: HashMap<String, FileMetadata> = self.list_files().into_iter().collect();

        let decoded = Update::decode_v1(update)
            .map_err(|e| DiaryxError::Crdt(format!("failed to decode update: {}", e)))?;

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DiaryxError::Crdt(format!("failed to apply update: {}", e)))?;
        }

        let files_after: HashMap<String, FileMetadata> = self.list_files().into_iter().collect();
        let renames = detect_renames(&files_before, &files_after);

        let mut changed_paths = Vec::new();

        for (path, metadata) in &files_after {
            if !files_before.contains_key(path) && !metadata.deleted {
                changed_paths.push(path.clone());
            }
        }

        for (path, metadata) in &files_after {
            if let Some(old_meta) = files_before.get(path) {
                if old_meta.deleted && !metadata.deleted && !changed_paths.contains(path) {
                    changed_paths.push(path.clone());
                }
            }
        }

        for (path, _old_meta) in &files_before {
            let is_deleted = files_after.get(path).map(|m| m.deleted).unwrap_or(true);
            if is_deleted && !changed_paths.contains(path) {
                changed_paths.push(path.clone());
            }
        }

        for (path, metadata) in &files_after {
            if metadata.deleted && !files_before.contains_key(path) && !changed_paths.contains(path)
            {
                changed_paths.push(path.clone());
            }
        }

        for (path, new_meta) in &files_after {
            if let Some(old_meta) = files_before.get(path) {
                if old_meta != new_meta && !new_meta.deleted && !old_meta.deleted {
                    if !changed_paths.contains(path) {
                        changed_paths.push(path.clone());
                    }
                }
            }
        }

        if origin != UpdateOrigin::Local && self.event_callback.is_some() {
            self.emit_diff_events(&files_before, &files_after, &renames);
        }

        let update_id = self.storage.append_update(&self.doc_name, update, origin)?;
        Ok((Some(update_id), changed_paths, renames))
    }

    /// Emit filesystem events for changes between two states.
    ///
    /// This compares the before and after states and emits appropriate events:
    /// - `FileRenamed` for files that were renamed (detected as delete+create with same parent)
    /// - `FileCreated` for new, non-deleted files (excluding renames)
    /// - `FileDeleted` for files that were deleted (excluding renames)
    /// - `MetadataChanged` for files whose metadata changed
    fn emit_diff_events(
        &self,
        before: &HashMap<String, FileMetadata>,
        after: &HashMap<String, FileMetadata>,
        renames: &[(String, String)],
    ) {
        let renamed_old_paths: std::collections::HashSet<&str> =
            renames.iter().map(|(old, _)| old.as_str()).collect();
        let renamed_new_paths: std::collections::HashSet<&str> =
            renames.iter().map(|(_, new)| new.as_str()).collect();

        for (old_path, new_path) in renames {
            self.emit_event(FileSystemEvent::file_renamed(
                PathBuf::from(old_path),
                PathBuf::from(new_path),
            ));
        }

        for (path, metadata) in after {
            if !before.contains_key(path)
                && !metadata.deleted
                && !renamed_new_paths.contains(path.as_str())
            {
                self.emit_event(FileSystemEvent::file_created_with_metadata(
                    PathBuf::from(path),
                    Some(self.metadata_to_frontmatter(metadata)),
                    metadata.parent.as_ref().map(PathBuf::from),
                ));
            }
        }

        for (path, metadata) in after {
            if let Some(old_meta) = before.get(path) {
                if old_meta.deleted && !metadata.deleted {
                    self.emit_event(FileSystemEvent::file_created_with_metadata(
                        PathBuf::from(path),
                        Some(self.metadata_to_frontmatter(metadata)),
                        metadata.parent.as_ref().map(PathBuf::from),
                    ));
                }
            }
        }

        for (path, old_meta) in before {
            if renamed_old_paths.contains(path.as_str()) {
                continue;
            }
            let is_deleted = after.get(path).map(|m| m.deleted).unwrap_or(true);
            if is_deleted {
                let parent = after
                    .get(path)
                    .and_then(|m| m.parent.as_ref())
                    .or(old_meta.parent.as_ref())
                    .map(PathBuf::from);
                self.emit_event(FileSystemEvent::file_deleted_with_parent(
                    PathBuf::from(path),
                    parent,
                ));
            }
        }

        for (path, metadata) in after {
            if metadata.deleted && !before.contains_key(path) {
                self.emit_event(FileSystemEvent::file_deleted_with_parent(
                    PathBuf::from(path),
                    metadata.parent.as_ref().map(PathBuf::from),
                ));
            }
        }

        for (path, new_meta) in after {
            if let Some(old_meta) = before.get(path) {
                if old_meta != new_meta && !new_meta.deleted && !old_meta.deleted {
                    self.emit_event(FileSystemEvent::metadata_changed(
                        PathBuf::from(path),
                        self.metadata_to_frontmatter(new_meta),
                    ));
                }
            }
        }
    }

    /// Convert FileMetadata to a serde_json::Value for event frontmatter.
    fn metadata_to_frontmatter(&self, metadata: &FileMetadata) -> serde_json::Value {
        serde_json::to_value(metadata).unwrap_or_else(|_| {
            serde_json::json!({
                "title": metadata.title
            })
        })
    }

    // ==================== Persistence ====================

    /// Save the current document state to storage.
    pub fn save(&self) -> StorageResult<()> {
        let state = self.encode_state_as_update();
        self.storage.save_doc(&self.doc_name, &state)
    }

    /// Reload the document state from storage, discarding local changes.
    pub fn reload(&mut self) -> StorageResult<()> {
        if let Some(state) = self.storage.load_doc(&self.doc_name)? {
            let update = Update::decode_v1(&state)
                .map_err(|e| DiaryxError::Crdt(format!("failed to decode CRDT state: {}", e)))?;

            self.doc = Doc::new();
            self.files_map = self.doc.get_or_insert_map(FILES_MAP_NAME);
            self.children_map = self.doc.get_or_insert_map(CHILDREN_MAP_NAME);
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DiaryxError::Crdt(format!("failed to apply update: {}", e)))?;
        }
        Ok(())
    }

    // ==================== History ====================

    /// Get all updates from storage for this document.
    pub fn get_history(&self) -> StorageResult<Vec<CrdtUpdate>> {
        self.storage.get_all_updates(&self.doc_name)
    }

    /// Get updates since a specific update ID.
    pub fn get_updates_since(&self, since_id: i64) -> StorageResult<Vec<CrdtUpdate>> {
        self.storage.get_updates_since(&self.doc_name, since_id)
    }

    /// Get the latest update ID.
    pub fn get_latest_update_id(&self) -> StorageResult<i64> {
        self.storage.get_latest_update_id(&self.doc_name)
    }

    // ==================== Observers ====================

    /// Subscribe to document updates.
    ///
    /// The callback receives the binary update data whenever the document changes.
    /// Returns a subscription that will unsubscribe when dropped.
    ///
    /// # Panics
    ///
    /// Panics if unable to acquire transaction for observing.
    pub fn observe_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .expect("Failed to observe document updates")
    }

    /// Subscribe to changes in the files map.
    ///
    /// The callback receives the path and new metadata (or None if removed)
    /// for each changed file.
    pub fn observe_files<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(Vec<(String, Option<FileMetadata>)>) + 'static,
    {
        self.files_map.observe(move |txn, event| {
            let changes: Vec<(String, Option<FileMetadata>)> = event
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let path = key.to_string();
                    match change {
                        yrs::types::EntryChange::Inserted(value)
                        | yrs::types::EntryChange::Updated(_, value) => {
                            let json = value.clone().cast::<String>().unwrap_or_default();
                            let metadata: Option<FileMetadata> = serde_json::from_str(&json).ok();
                            (path, metadata)
                        }
                        yrs::types::EntryChange::Removed(_) => (path, None),
                    }
                })
                .collect();

            if !changes.is_empty() {
                callback(changes);
            }
        })
    }
}

/// Coalesce duplicate entries while keeping the first occurrence's position.
///
/// Two devices concurrently calling `add_child` with the same child path
/// (each believing it isn't present yet in its own replica) both produce a
/// surviving insert once merged; this is where the resulting duplicate is
/// collapsed back down on read.
fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

/// Detect renames between two snapshots of the files map using three
/// strategies in order of confidence:
/// 1. Same parent AND same title.
/// 2. Same parent AND similar `modified_at` timestamp (within 5 seconds).
/// 3. Same parent with exactly ONE unmatched candidate pair (fallback).
fn detect_renames(
    files_before: &HashMap<String, FileMetadata>,
    files_after: &HashMap<String, FileMetadata>,
) -> Vec<(String, String)> {
    let mut renames: Vec<(String, String)> = Vec::new();
    let mut matched_created: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut matched_deleted: std::collections::HashSet<&str> = std::collections::HashSet::new();

    let deleted_files: Vec<(&String, &FileMetadata)> = files_before
        .iter()
        .filter(|(path, old_meta)| {
            if old_meta.deleted {
                return false;
            }
            files_after.get(*path).map(|m| m.deleted).unwrap_or(true)
        })
        .collect();

    let created_files: Vec<(&String, &FileMetadata)> = files_after
        .iter()
        .filter(|(path, meta)| !files_before.contains_key(*path) && !meta.deleted)
        .collect();

    // Strategy 1: same parent and same title.
    for (deleted_path, deleted_meta) in &deleted_files {
        for (created_path, _) in &created_files {
            if matched_created.contains(created_path.as_str()) {
                continue;
            }
            let created_meta = files_after.get(*created_path);
            let same_parent = deleted_meta.parent == created_meta.and_then(|m| m.parent.clone());
            let same_title = deleted_meta.title.is_some()
                && deleted_meta.title == created_meta.and_then(|m| m.title.clone());

            if same_parent && same_title {
                renames.push(((*deleted_path).clone(), (*created_path).clone()));
                matched_created.insert(created_path.as_str());
                matched_deleted.insert(deleted_path.as_str());
                break;
            }
        }
    }

    // Strategy 2: same parent and similar modified_at timestamp.
    const TIMESTAMP_THRESHOLD_MS: i64 = 5000;
    for (deleted_path, deleted_meta) in &deleted_files {
        if matched_deleted.contains(deleted_path.as_str()) {
            continue;
        }
        for (created_path, _) in &created_files {
            if matched_created.contains(created_path.as_str()) {
                continue;
            }
            let created_meta = files_after.get(*created_path);
            let same_parent = deleted_meta.parent == created_meta.and_then(|m| m.parent.clone());
            let similar_timestamp = created_meta
                .map(|m| (deleted_meta.modified_at - m.modified_at).abs() < TIMESTAMP_THRESHOLD_MS)
                .unwrap_or(false);

            if same_parent && similar_timestamp {
                renames.push(((*deleted_path).clone(), (*created_path).clone()));
                matched_created.insert(created_path.as_str());
                matched_deleted.insert(deleted_path.as_str());
                break;
            }
        }
    }

    // Strategy 3: single-pair fallback under a shared parent.
    for (created_path, _) in &created_files {
        if matched_created.contains(created_path.as_str()) {
            continue;
        }
        let created_meta = files_after.get(*created_path);
        let created_parent = created_meta.and_then(|m| m.parent.clone());

        let matching_deleted: Vec<_> = deleted_files
            .iter()
            .filter(|(dp, dm)| !matched_deleted.contains(dp.as_str()) && dm.parent == created_parent)
            .collect();

        if matching_deleted.len() == 1 {
            let (deleted_path, _) = matching_deleted[0];
            renames.push(((*deleted_path).clone(), (*created_path).clone()));
            matched_created.insert(created_path.as_str());
            matched_deleted.insert(deleted_path.as_str());
        }
    }

    renames
}

impl std::fmt::Debug for WorkspaceCrdt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCrdt")
            .field("doc_name", &self.doc_name)
            .field("file_count", &self.file_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStorage;

    fn create_test_crdt() -> WorkspaceCrdt {
        let storage: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        WorkspaceCrdt::new(storage)
    }

    #[test]
    fn test_new_workspace_is_empty() {
        let crdt = create_test_crdt();
        assert_eq!(crdt.file_count(), 0);
        assert!(crdt.list_files().is_empty());
    }

    #[test]
    fn test_set_and_get_file() {
        let crdt = create_test_crdt();

        let metadata = FileMetadata::new(Some("Test File".to_string()));
        crdt.set_file("test.md", metadata.clone()).unwrap();

        let retrieved = crdt.get_file("test.md").unwrap();
        assert_eq!(retrieved.title, Some("Test File".to_string()));
    }

    #[test]
    fn test_get_nonexistent_file() {
        let crdt = create_test_crdt();
        assert!(crdt.get_file("nonexistent.md").is_none());
    }

    #[test]
    fn test_update_file() {
        let crdt = create_test_crdt();

        let mut metadata = FileMetadata::new(Some("Original".to_string()));
        crdt.set_file("test.md", metadata.clone()).unwrap();

        metadata.title = Some("Updated".to_string());
        crdt.set_file("test.md", metadata).unwrap();

        let retrieved = crdt.get_file("test.md").unwrap();
        assert_eq!(retrieved.title, Some("Updated".to_string()));
        assert_eq!(crdt.file_count(), 1);
    }

    #[test]
    fn test_tombstone_and_restore() {
        let crdt = create_test_crdt();

        let metadata = FileMetadata::new(Some("To Delete".to_string()));
        crdt.set_file("test.md", metadata).unwrap();

        crdt.tombstone("test.md").unwrap();
        assert!(crdt.get_file("test.md").unwrap().deleted);

        crdt.restore("test.md").unwrap();
        assert!(!crdt.get_file("test.md").unwrap().deleted);
        assert_eq!(crdt.file_count(), 1);
    }

    #[test]
    fn test_list_active_files() {
        let crdt = create_test_crdt();

        crdt.set_file("active.md", FileMetadata::new(Some("Active".to_string())))
            .unwrap();
        crdt.set_file("deleted.md", FileMetadata::new(Some("Deleted".to_string())))
            .unwrap();
        crdt.tombstone("deleted.md").unwrap();

        let all = crdt.list_files();
        assert_eq!(all.len(), 2);

        let active = crdt.list_active_files();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "active.md");
    }

    #[test]
    fn test_remove_file() {
        let crdt = create_test_crdt();

        crdt.set_file("test.md", FileMetadata::new(Some("Test".to_string())))
            .unwrap();
        assert_eq!(crdt.file_count(), 1);

        crdt.remove_file("test.md").unwrap();
        assert_eq!(crdt.file_count(), 0);
        assert!(crdt.get_file("test.md").is_none());
    }

    #[test]
    fn test_encode_and_apply_update() {
        let crdt1 = create_test_crdt();
        let crdt2 = create_test_crdt();

        crdt1
            .set_file("file1.md", FileMetadata::new(Some("File 1".to_string())))
            .unwrap();
        crdt1
            .set_file("file2.md", FileMetadata::new(Some("File 2".to_string())))
            .unwrap();

        let update = crdt1.encode_state_as_update();
        crdt2.apply_update(&update, UpdateOrigin::Remote).unwrap();

        assert_eq!(crdt2.file_count(), 2);
        assert!(crdt2.get_file("file1.md").is_some());
        assert!(crdt2.get_file("file2.md").is_some());
    }

    #[test]
    fn test_encode_diff() {
        let crdt1 = create_test_crdt();
        let crdt2 = create_test_crdt();

        crdt1
            .set_file("file1.md", FileMetadata::new(Some("File 1".to_string())))
            .unwrap();

        let update = crdt1.encode_state_as_update();
        crdt2.apply_update(&update, UpdateOrigin::Sync).unwrap();

        crdt1
            .set_file("file2.md", FileMetadata::new(Some("File 2".to_string())))
            .unwrap();

        let sv = crdt2.encode_state_vector();
        let diff = crdt1.encode_diff(&sv).unwrap();

        crdt2.apply_update(&diff, UpdateOrigin::Remote).unwrap();

        assert_eq!(crdt2.file_count(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let storage: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());

        {
            let crdt1 = WorkspaceCrdt::new(Arc::clone(&storage));
            crdt1
                .set_file("file1.md", FileMetadata::new(Some("File 1".to_string())))
                .unwrap();
            crdt1
                .set_file("file2.md", FileMetadata::new(Some("File 2".to_string())))
                .unwrap();
            crdt1.save().unwrap();
        }

        let crdt2 = WorkspaceCrdt::load(storage).unwrap();
        assert_eq!(crdt2.file_count(), 2);
        assert_eq!(
            crdt2.get_file("file1.md").unwrap().title,
            Some("File 1".to_string())
        );
    }

    #[test]
    fn test_concurrent_edits_merge() {
        let storage1: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        let storage2: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());

        let crdt1 = WorkspaceCrdt::new(storage1);
        let crdt2 = WorkspaceCrdt::new(storage2);

        crdt1
            .set_file(
                "file1.md",
                FileMetadata::new(Some("From CRDT1".to_string())),
            )
            .unwrap();
        crdt2
            .set_file(
                "file2.md",
                FileMetadata::new(Some("From CRDT2".to_string())),
            )
            .unwrap();

        let update1 = crdt1.encode_state_as_update();
        let update2 = crdt2.encode_state_as_update();

        crdt1.apply_update(&update2, UpdateOrigin::Remote).unwrap();
        crdt2.apply_update(&update1, UpdateOrigin::Remote).unwrap();

        assert_eq!(crdt1.file_count(), 2);
        assert_eq!(crdt2.file_count(), 2);
        assert!(crdt1.get_file("file1.md").is_some());
        assert!(crdt1.get_file("file2.md").is_some());
        assert!(crdt2.get_file("file1.md").is_some());
        assert!(crdt2.get_file("file2.md").is_some());
    }

    #[test]
    fn test_file_metadata_with_children() {
        let crdt = create_test_crdt();

        let mut metadata = FileMetadata::new(Some("Index".to_string()));
        metadata.parent = None;
        metadata.children = Some(vec!["child1.md".to_string(), "child2.md".to_string()]);
        metadata.audience = Some(vec!["public".to_string()]);

        crdt.set_file("index.md", metadata).unwrap();

        let retrieved = crdt.get_file("index.md").unwrap();
        assert_eq!(retrieved.children.unwrap().len(), 2);
        assert_eq!(retrieved.audience.unwrap(), vec!["public"]);
    }

    #[test]
    fn test_observer_fires_on_change() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let crdt = create_test_crdt();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let changes_clone = Rc::clone(&changes);

        let _sub = crdt.observe_files(move |file_changes| {
            changes_clone.borrow_mut().extend(file_changes);
        });

        crdt.set_file("test.md", FileMetadata::new(Some("Test".to_string())))
            .unwrap();

        let captured = changes.borrow();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, "test.md");
    }

    // ==================== Hierarchy Tests ====================

    #[test]
    fn test_add_and_remove_child() {
        let crdt = create_test_crdt();
        crdt.set_file("index.md", FileMetadata::with_filename("index.md".into(), None))
            .unwrap();
        crdt.set_file(
            "child.md",
            FileMetadata::with_filename("child.md".into(), None),
        )
        .unwrap();

        crdt.add_child("index.md", "child.md").unwrap();
        let parent = crdt.get_file("index.md").unwrap();
        assert_eq!(parent.children, Some(vec!["child.md".to_string()]));

        crdt.remove_child("index.md", "child.md").unwrap();
        let parent = crdt.get_file("index.md").unwrap();
        assert_eq!(parent.children, Some(vec![]));
    }

    #[test]
    fn test_rename_updates_parent_children() {
        let crdt = create_test_crdt();
        let mut parent = FileMetadata::with_filename("folder/index.md".into(), None);
        parent.children = Some(vec!["folder/old-name.md".to_string()]);
        crdt.set_file("folder/index.md", parent).unwrap();

        let mut child = FileMetadata::with_filename("old-name.md".into(), Some("Test".into()));
        child.parent = Some("folder/index.md".to_string());
        crdt.set_file("folder/old-name.md", child).unwrap();

        crdt.rename("folder/old-name.md", "folder/new-name.md")
            .unwrap();

        assert!(crdt.get_file("folder/old-name.md").is_none());
        let renamed = crdt.get_file("folder/new-name.md").unwrap();
        assert_eq!(renamed.filename, "new-name.md");
        assert_eq!(renamed.title, Some("Test".to_string()));

        let parent = crdt.get_file("folder/index.md").unwrap();
        assert_eq!(
            parent.children,
            Some(vec!["folder/new-name.md".to_string()])
        );
    }

    #[test]
    fn test_move_to_updates_both_parents() {
        let crdt = create_test_crdt();
        crdt.set_file(
            "folder1/index.md",
            FileMetadata::with_filename("index.md".into(), None),
        )
        .unwrap();
        crdt.set_file(
            "folder2/index.md",
            FileMetadata::with_filename("index.md".into(), None),
        )
        .unwrap();

        let mut file_meta = FileMetadata::with_filename("file.md".into(), Some("Test".into()));
        file_meta.parent = Some("folder1/index.md".to_string());
        crdt.set_file("folder1/file.md", file_meta).unwrap();
        crdt.add_child("folder1/index.md", "folder1/file.md")
            .unwrap();

        let new_path = crdt
            .move_to("folder1/file.md", Some("folder2/index.md"))
            .unwrap();
        assert_eq!(new_path, "folder2/file.md");

        assert!(crdt.get_file("folder1/file.md").is_none());
        let moved = crdt.get_file("folder2/file.md").unwrap();
        assert_eq!(moved.parent, Some("folder2/index.md".to_string()));

        let folder1 = crdt.get_file("folder1/index.md").unwrap();
        assert_eq!(folder1.children, Some(vec![]));
        let folder2 = crdt.get_file("folder2/index.md").unwrap();
        assert_eq!(folder2.children, Some(vec!["folder2/file.md".to_string()]));
    }

    #[test]
    fn test_build_tree() {
        let crdt = create_test_crdt();
        let mut root = FileMetadata::with_filename("index.md".into(), None);
        root.children = Some(vec!["daily.md".to_string()]);
        crdt.set_file("index.md", root).unwrap();

        let mut child = FileMetadata::with_filename("daily.md".into(), None);
        child.parent = Some("index.md".to_string());
        crdt.set_file("daily.md", child).unwrap();

        let tree = crdt.build_tree().unwrap();
        assert_eq!(tree.path, "index.md");
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].path, "daily.md");
        assert!(tree.children[0].children.is_empty());
    }

    #[test]
    fn test_build_tree_no_root_returns_none() {
        let crdt = create_test_crdt();
        crdt.set_file("orphan.md", FileMetadata::with_filename("orphan.md".into(), None))
            .unwrap();
        assert!(crdt.build_tree().is_none());
    }

    #[test]
    fn test_build_tree_detects_cycle_without_hanging() {
        let crdt = create_test_crdt();
        crdt.set_file("a.md", FileMetadata::with_filename("a.md".into(), None))
            .unwrap();
        crdt.set_file("b.md", FileMetadata::with_filename("b.md".into(), None))
            .unwrap();
        crdt.add_child("a.md", "b.md").unwrap();
        // b.md pointing back at a.md makes `children` cyclic, not a DAG.
        crdt.add_child("b.md", "a.md").unwrap();

        let tree = crdt.build_tree().unwrap();
        assert_eq!(tree.path, "a.md");
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].path, "b.md");
        let cycle_stub = &tree.children[0].children;
        assert_eq!(cycle_stub.len(), 1);
        assert_eq!(cycle_stub[0].path, "a.md");
        assert!(cycle_stub[0].children.is_empty());
    }

    /// S1: two offline devices each add a different child under the shared
    /// root, then reconnect - both inserts must survive the merge instead of
    /// one clobbering the other's whole-record write.
    #[test]
    fn test_concurrent_add_child_merges_both() {
        let storage1: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        let storage2: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        let crdt1 = WorkspaceCrdt::new(storage1);
        let crdt2 = WorkspaceCrdt::new(storage2);

        crdt1
            .set_file("index.md", FileMetadata::with_filename("index.md".into(), None))
            .unwrap();
        let base = crdt1.encode_state_as_update();
        crdt2.apply_update(&base, UpdateOrigin::Remote).unwrap();

        // Offline: each device creates and links its own child to the root.
        crdt1
            .set_file("a.md", FileMetadata::with_filename("a.md".into(), None))
            .unwrap();
        crdt1.add_child("index.md", "a.md").unwrap();

        crdt2
            .set_file("b.md", FileMetadata::with_filename("b.md".into(), None))
            .unwrap();
        crdt2.add_child("index.md", "b.md").unwrap();

        // Reconnect: exchange updates both ways.
        let update1 = crdt1.encode_state_as_update();
        let update2 = crdt2.encode_state_as_update();
        crdt1.apply_update(&update2, UpdateOrigin::Remote).unwrap();
        crdt2.apply_update(&update1, UpdateOrigin::Remote).unwrap();

        let children1 = crdt1.get_file("index.md").unwrap().children.unwrap();
        let children2 = crdt2.get_file("index.md").unwrap().children.unwrap();

        assert_eq!(children1.len(), 2);
        assert!(children1.contains(&"a.md".to_string()));
        assert!(children1.contains(&"b.md".to_string()));
        // Convergence: both replicas order the merge identically.
        assert_eq!(children1, children2);
    }

    #[test]
    fn test_concurrent_remove_and_insert_commute() {
        let storage1: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        let storage2: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        let crdt1 = WorkspaceCrdt::new(storage1);
        let crdt2 = WorkspaceCrdt::new(storage2);

        crdt1
            .set_file("index.md", FileMetadata::with_filename("index.md".into(), None))
            .unwrap();
        crdt1
            .set_file("a.md", FileMetadata::with_filename("a.md".into(), None))
            .unwrap();
        crdt1.add_child("index.md", "a.md").unwrap();
        let base = crdt1.encode_state_as_update();
        crdt2.apply_update(&base, UpdateOrigin::Remote).unwrap();

        // Offline: crdt1 removes "a.md" while crdt2 concurrently adds "b.md".
        crdt1.remove_child("index.md", "a.md").unwrap();
        crdt2
            .set_file("b.md", FileMetadata::with_filename("b.md".into(), None))
            .unwrap();
        crdt2.add_child("index.md", "b.md").unwrap();

        let update1 = crdt1.encode_state_as_update();
        let update2 = crdt2.encode_state_as_update();
        crdt1.apply_update(&update2, UpdateOrigin::Remote).unwrap();
        crdt2.apply_update(&update1, UpdateOrigin::Remote).unwrap();

        let children1 = crdt1.get_file("index.md").unwrap().children.unwrap();
        let children2 = crdt2.get_file("index.md").unwrap().children.unwrap();
        assert_eq!(children1, vec!["b.md".to_string()]);
        assert_eq!(children1, children2);
    }

    #[test]
    fn test_rename_detection_by_title() {
        let crdt1 = create_test_crdt();
        let crdt2 = create_test_crdt();

        crdt1
            .set_file(
                "old.md",
                FileMetadata::with_filename("old.md".into(), Some("Same Title".into())),
            )
            .unwrap();
        let base = crdt1.encode_state_as_update();
        crdt2.apply_update(&base, UpdateOrigin::Remote).unwrap();

        crdt1.rename("old.md", "new.md").unwrap();

        let diff = crdt1.encode_diff(&crdt2.encode_state_vector()).unwrap();
        let (_, _changed, renames) = crdt2
            .apply_update_tracking_changes(&diff, UpdateOrigin::Remote)
            .unwrap();

        assert_eq!(renames, vec![("old.md".to_string(), "new.md".to_string())]);
    }
}

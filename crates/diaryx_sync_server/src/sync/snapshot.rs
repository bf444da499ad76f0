//! Workspace snapshot archives (§4.6 Snapshot Service).
//!
//! A snapshot is a zip archive containing the current materialized file tree
//! of a workspace: one entry per active (non-tombstoned) file, each holding
//! its rendered YAML frontmatter plus body, and a trailer entry carrying the
//! workspace's state vector at the moment the archive was produced. New
//! clients download a snapshot to bootstrap instead of replaying the entire
//! causal log; snapshots can also be uploaded to replace or merge a
//! workspace's contents. Either direction replays through the CRDTs -- the
//! archive never bypasses them.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use diaryx_core::crdt::{BodyDocManager, FileMetadata, WorkspaceCrdt};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Name of the trailer entry carrying the producing workspace's state vector.
const MANIFEST_ENTRY: &str = ".diaryx-manifest.json";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Manifest {
    /// Base64-encoded workspace state vector, as of archive creation.
    state_vector: String,
    file_count: usize,
}

/// How an uploaded archive's files are merged into the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Files present in the workspace but absent from the archive are
    /// tombstoned.
    Replace,
    /// The archive is a union: nothing in the workspace is removed.
    Merge,
}

impl std::str::FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(ImportMode::Replace),
            "merge" => Ok(ImportMode::Merge),
            other => Err(format!("unknown snapshot mode '{other}'")),
        }
    }
}

/// Render a file's frontmatter (the user-visible subset of [`FileMetadata`])
/// plus its body as a single markdown document with a YAML front matter
/// block.
fn render_file(metadata: &FileMetadata, body: &str) -> Result<String, String> {
    let mut front: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    if let Some(title) = &metadata.title {
        front.insert("title".into(), serde_yaml::Value::String(title.clone()));
    }
    if let Some(description) = &metadata.description {
        front.insert(
            "description".into(),
            serde_yaml::Value::String(description.clone()),
        );
    }
    if let Some(audience) = &metadata.audience {
        front.insert(
            "audience".into(),
            serde_yaml::to_value(audience).map_err(|e| e.to_string())?,
        );
    }
    for (key, value) in &metadata.extra {
        front.insert(
            key.clone(),
            serde_yaml::to_value(value).map_err(|e| e.to_string())?,
        );
    }

    if front.is_empty() {
        return Ok(body.to_string());
    }

    let yaml = serde_yaml::to_string(&front).map_err(|e| e.to_string())?;
    Ok(format!("---\n{yaml}---\n{body}"))
}

/// Split a rendered file back into frontmatter key/values and body text.
fn parse_file(contents: &str) -> (BTreeMap<String, serde_yaml::Value>, String) {
    let Some(rest) = contents.strip_prefix("---\n") else {
        return (BTreeMap::new(), contents.to_string());
    };
    let Some(end) = rest.find("\n---\n") else {
        return (BTreeMap::new(), contents.to_string());
    };
    let (yaml, body) = rest.split_at(end);
    let body = &body[5..]; // skip "\n---\n"
    let front = serde_yaml::from_str(yaml).unwrap_or_default();
    (front, body.to_string())
}

/// Produce a snapshot archive of every active file in `workspace`.
pub fn export_snapshot(
    workspace: &WorkspaceCrdt,
    body_docs: &BodyDocManager,
) -> Result<Vec<u8>, String> {
    let mut buf = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut buf);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let active = workspace.list_active_files();
    for (path, metadata) in &active {
        let body_doc = body_docs.get_or_create(path);
        let rendered = render_file(metadata, &body_doc.get_body())?;
        zip.start_file(path, options).map_err(|e| e.to_string())?;
        zip.write_all(rendered.as_bytes())
            .map_err(|e| e.to_string())?;
    }

    let manifest = Manifest {
        state_vector: BASE64.encode(workspace.encode_state_vector()),
        file_count: active.len(),
    };
    zip.start_file(MANIFEST_ENTRY, options)
        .map_err(|e| e.to_string())?;
    zip.write_all(
        serde_json::to_string(&manifest)
            .map_err(|e| e.to_string())?
            .as_bytes(),
    )
    .map_err(|e| e.to_string())?;

    zip.finish().map_err(|e| e.to_string())?;
    Ok(buf.into_inner())
}

/// Replay an uploaded snapshot archive into `workspace`, creating or
/// updating a [`diaryx_core::crdt::BodyDoc`] per entry. Returns the number of
/// files imported.
pub fn import_snapshot(
    archive_bytes: &[u8],
    workspace: &WorkspaceCrdt,
    body_docs: &BodyDocManager,
    mode: ImportMode,
) -> Result<usize, String> {
    let mut archive =
        ZipArchive::new(Cursor::new(archive_bytes)).map_err(|e| e.to_string())?;

    let mut imported_paths = std::collections::HashSet::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| e.to_string())?;
        if entry.name() == MANIFEST_ENTRY || entry.is_dir() {
            continue;
        }
        let path = entry.name().to_string();
        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| e.to_string())?;
        drop(entry);

        let (front, body) = parse_file(&contents);
        let mut metadata = workspace.get_file(&path).unwrap_or_default();
        metadata.filename = path.rsplit('/').next().unwrap_or(&path).to_string();
        metadata.title = front
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        metadata.description = front
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        metadata.audience = front
            .get("audience")
            .and_then(|v| serde_yaml::from_value(v.clone()).ok());
        metadata.extra = front
            .into_iter()
            .filter(|(k, _)| !matches!(k.as_str(), "title" | "description" | "audience"))
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k, v)))
            .collect();
        metadata.deleted = false;
        metadata.modified_at = chrono::Utc::now().timestamp_millis();

        workspace
            .set_file(&path, metadata)
            .map_err(|e| e.to_string())?;

        let body_doc = body_docs.get_or_create(&path);
        body_doc.set_body(&body).map_err(|e| e.to_string())?;

        imported_paths.insert(path);
    }

    if mode == ImportMode::Replace {
        for (path, metadata) in workspace.list_active_files() {
            if !imported_paths.contains(&path) && !metadata.deleted {
                workspace.tombstone(&path).map_err(|e| e.to_string())?;
            }
        }
    }

    Ok(imported_paths.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use diaryx_core::crdt::MemoryStorage;
    use std::sync::Arc;

    fn fresh_workspace() -> (WorkspaceCrdt, BodyDocManager) {
        let storage = Arc::new(MemoryStorage::new());
        let workspace = WorkspaceCrdt::with_name(storage.clone(), "ws1".to_string());
        let body_docs = BodyDocManager::new(storage);
        (workspace, body_docs)
    }

    #[test]
    fn export_then_import_round_trips_active_files() {
        let (workspace, body_docs) = fresh_workspace();
        let mut meta = FileMetadata::with_filename("a.md".to_string(), Some("A".to_string()));
        meta.description = Some("desc".to_string());
        workspace.set_file("a.md", meta).unwrap();
        body_docs.get_or_create("a.md").set_body("hello world").unwrap();

        let archive = export_snapshot(&workspace, &body_docs).unwrap();

        let (workspace2, body_docs2) = fresh_workspace();
        let imported = import_snapshot(&archive, &workspace2, &body_docs2, ImportMode::Replace).unwrap();

        assert_eq!(imported, 1);
        let meta2 = workspace2.get_file("a.md").unwrap();
        assert_eq!(meta2.title.as_deref(), Some("A"));
        assert_eq!(meta2.description.as_deref(), Some("desc"));
        assert_eq!(body_docs2.get_or_create("a.md").get_body(), "hello world");
    }

    #[test]
    fn replace_mode_tombstones_missing_files() {
        let (workspace, body_docs) = fresh_workspace();
        workspace
            .set_file("keep.md", FileMetadata::with_filename("keep.md".into(), None))
            .unwrap();
        workspace
            .set_file("drop.md", FileMetadata::with_filename("drop.md".into(), None))
            .unwrap();

        let mut archive_files = BTreeMap::new();
        archive_files.insert("keep.md".to_string(), FileMetadata::default());
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default();
            zip.start_file("keep.md", options).unwrap();
            zip.write_all(b"kept").unwrap();
            zip.finish().unwrap();
        }

        import_snapshot(&buf.into_inner(), &workspace, &body_docs, ImportMode::Replace).unwrap();

        assert!(!workspace.get_file("keep.md").unwrap().deleted);
        assert!(workspace.get_file("drop.md").unwrap().deleted);
    }

    #[test]
    fn import_mode_parses() {
        assert_eq!("replace".parse::<ImportMode>().unwrap(), ImportMode::Replace);
        assert_eq!("merge".parse::<ImportMode>().unwrap(), ImportMode::Merge);
        assert!("bogus".parse::<ImportMode>().is_err());
    }
}

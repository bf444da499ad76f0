//! CRDT-based synchronization engine for the workspace file hierarchy and
//! individual file bodies.
//!
//! Files are synchronized in two layers: [`WorkspaceCrdt`] tracks the
//! hierarchy and frontmatter of every file as a flat, path-keyed Y.Map, while
//! [`BodyDoc`]/[`BodyDocManager`] track each file's markdown body as its own
//! yrs text document so concurrent edits to the same paragraph merge
//! character-by-character instead of colliding at the whole-file level.

mod body_doc;
mod body_doc_manager;
mod events;
mod history;
mod memory_storage;
#[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
mod sqlite_storage;
mod storage;
mod sync;
mod sync_engine;
mod types;
mod workspace_doc;

pub use body_doc::BodyDoc;
pub use body_doc_manager::BodyDocManager;
pub use events::FileSystemEvent;
pub use history::{ChangeType, FileDiff, HistoryEntry, HistoryManager};
pub use memory_storage::MemoryStorage;
#[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{CrdtStorage, StorageResult};
pub use sync::{BodySyncProtocol, SyncMessage, SyncProtocol};
pub use sync_engine::{
    frame_with_doc_id, unframe_doc_id, EngineOutput, Session, SessionAction, SessionEvent,
    SessionKind, SessionPhase, SyncDocument,
};
pub use types::{BinaryRef, CrdtUpdate, FileMetadata, UpdateOrigin};
pub use workspace_doc::WorkspaceCrdt;

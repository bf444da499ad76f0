mod room;
mod snapshot;

pub use room::{ControlMessage, SessionContext, SyncRoom, SyncState, SyncStats};
pub use snapshot::{ImportMode, export_snapshot, import_snapshot};

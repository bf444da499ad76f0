//! I/O-free sync engine driving the handshake and steady-state protocol for
//! one document session.
//!
//! A [`Session`] owns no socket and performs no I/O: it consumes inbound
//! frames via [`Session::inject_binary`]/[`Session::inject_text`], consumes
//! local CRDT updates via [`Session::queue_local_update`], and is advanced by
//! an environment-supplied [`Session::tick`]. Callers collect everything the
//! engine produced — outbound frames, control messages, and application
//! events — by calling [`Session::drain`]. This mirrors the transport
//! boundary already used by [`super::sync::SyncProtocol`], generalized into
//! an explicit phase machine and a doc-id-prefixed wire framing so a single
//! socket can multiplex the workspace document and any number of focused
//! body documents.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::storage::StorageResult;
use super::sync::SyncMessage;
use super::types::UpdateOrigin;
use crate::error::DiaryxError;

/// How long a handshake phase may sit idle before the engine re-sends
/// SyncStep1 on the next `tick`.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(5_000);

/// How long a focused-but-unanswered body request is kept before it ages out.
const BODY_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// A CRDT document the engine can drive through a sync handshake.
///
/// Implemented by [`super::workspace_doc::WorkspaceCrdt`] (workspace
/// documents) and [`super::body_doc::BodyDoc`] (body documents), so one
/// engine implementation serves both without caring which kind of record it
/// is multiplexing.
pub trait SyncDocument {
    /// Encode the current state vector.
    fn state_vector(&self) -> Vec<u8>;

    /// Encode the updates the peer is missing, given their state vector.
    fn diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>>;

    /// Apply an update from any origin.
    fn apply(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()>;
}

impl SyncDocument for super::workspace_doc::WorkspaceCrdt {
    fn state_vector(&self) -> Vec<u8> {
        self.encode_state_vector()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        self.encode_diff(remote_state_vector)
    }

    fn apply(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        self.apply_update(update, origin).map(|_| ())
    }
}

impl SyncDocument for super::body_doc::BodyDoc {
    fn state_vector(&self) -> Vec<u8> {
        self.encode_state_vector()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        self.encode_diff(remote_state_vector)
    }

    fn apply(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        self.apply_update(update, origin).map(|_| ())
    }
}

/// Which protocol a [`Session`] runs: the workspace document has a
/// snapshot-bootstrap phase that body documents skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// The single per-workspace hierarchy/metadata document.
    Workspace,
    /// One of a file's per-path body documents.
    Body,
}

/// Phase of a single document's sync session.
///
/// See the module-level documentation for the transitions between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum SessionPhase {
    /// No transport attached.
    Disconnected,
    /// Transport attached, SyncStep1 not yet sent.
    Connecting,
    /// SyncStep1 sent, awaiting the peer's first reply.
    Handshake1,
    /// A manifest/Step2 exchange is underway but not yet complete.
    Handshake2,
    /// Waiting on an externally-driven snapshot import (workspace only).
    BootstrappingFiles,
    /// Updates are flowing; not yet confirmed fully caught up.
    Syncing,
    /// Both directions have exchanged an empty Step2: caught up.
    Synced,
    /// The backing document's log reported `IntegrityViolation`; terminal.
    Poisoned,
}

/// An action the environment must perform outside the engine (I/O the
/// engine itself cannot do).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "action")]
pub enum SessionAction {
    /// Fetch `/api/workspaces/{id}/snapshot` and import it, then call
    /// [`Session::on_snapshot_imported`].
    DownloadSnapshot {
        /// Workspace id to bootstrap.
        workspace_id: String,
    },
}

/// An application-visible event emitted by the sync engine, distinct from
/// the CRDT-level [`super::events::FileSystemEvent`] stream.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Overall connection status changed.
    StatusChanged {
        /// One of "connecting", "syncing", "synced", "error".
        status: String,
        /// Present when `status == "error"`.
        #[serde(default)]
        error: Option<String>,
    },
    /// Bootstrap/body-sync progress.
    Progress {
        /// Items completed so far.
        completed: usize,
        /// Total items expected.
        total: usize,
    },
    /// Initial sync completed.
    SyncComplete {
        /// Number of files synced.
        files_synced: usize,
    },
    /// The set of focused body documents changed.
    FocusListChanged {
        /// Paths now focused.
        files: Vec<String>,
    },
    /// A peer connected to a shared session.
    PeerJoined {
        /// Peer identifier.
        peer_id: String,
    },
    /// A peer disconnected from a shared session.
    PeerLeft {
        /// Peer identifier.
        peer_id: String,
    },
    /// This client joined a share session.
    SessionJoined,
    /// The share session ended (host left, or was closed).
    SessionEnded,
    /// A non-fatal protocol or transport error occurred.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// Incoming text control message shapes, matching the closed `type` set in
/// the external WebSocket interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
    FileManifest {
        #[serde(default)]
        client_is_new: bool,
        #[serde(default)]
        manifest: Vec<serde_json::Value>,
    },
    FilesReady,
    #[serde(rename = "sync_progress")]
    SyncProgress { completed: usize, total: usize },
    #[serde(rename = "sync_complete")]
    SyncComplete { files_synced: usize },
    #[serde(rename = "focus_list_changed")]
    FocusListChanged { files: Vec<String> },
    #[serde(rename = "peer_joined")]
    PeerJoined { peer_id: String },
    #[serde(rename = "peer_left")]
    PeerLeft { peer_id: String },
    #[serde(rename = "session_joined")]
    SessionJoined,
    #[serde(rename = "session_ended")]
    SessionEnded,
}

/// One item the engine wants the environment to act on: an outbound frame,
/// an out-of-band action request, or an application event.
///
/// Collected via [`Session::drain`], matching the transport boundary's
/// `drain() -> { outgoing_binary, outgoing_text, events }` shape from one
/// queue instead of three, ordered as the engine produced them.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    /// A binary sync frame, already wire-framed with the doc-id prefix.
    Binary(Vec<u8>),
    /// A text control frame (JSON), already serialized.
    Text(String),
    /// An action the transport adapter must perform (e.g. download a
    /// snapshot) before the session can progress.
    Action(SessionAction),
    /// An application-visible event.
    Event(SessionEvent),
}

/// Prefix a sync payload with `[u8 doc-id-length][doc-id-bytes][payload]`.
///
/// `doc-id` must be ASCII and non-empty (length 0 is reserved).
pub fn frame_with_doc_id(doc_id: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(!doc_id.is_empty() && doc_id.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(1 + doc_id.len() + payload.len());
    out.push(doc_id.len() as u8);
    out.extend_from_slice(doc_id.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a doc-id-prefixed frame into its doc-id and payload.
///
/// Returns `None` if the frame is too short or declares a zero-length
/// doc-id (reserved, invalid).
pub fn unframe_doc_id(frame: &[u8]) -> Option<(&str, &[u8])> {
    let &len = frame.first()?;
    if len == 0 {
        return None;
    }
    let len = len as usize;
    if frame.len() < 1 + len {
        return None;
    }
    let doc_id = std::str::from_utf8(&frame[1..1 + len]).ok()?;
    Some((doc_id, &frame[1 + len..]))
}

/// The sync session for a single document.
///
/// Owns no document state itself; callers pass a `&dyn SyncDocument` handle
/// into every method that needs to read or mutate the backing CRDT, per the
/// ownership model in which documents are owned exclusively by storage and
/// the engine only holds handles to them.
pub struct Session {
    doc_id: String,
    kind: SessionKind,
    phase: SessionPhase,
    outgoing: VecDeque<EngineOutput>,
    pending_local_updates: VecDeque<Vec<u8>>,
    focus_set: std::collections::HashSet<String>,
    handshake_started_at: Option<Duration>,
    sent_empty_step2: bool,
    received_empty_step2: bool,
}

impl Session {
    /// Create a new, disconnected session for `doc_id`.
    pub fn new(doc_id: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            doc_id: doc_id.into(),
            kind,
            phase: SessionPhase::Disconnected,
            outgoing: VecDeque::new(),
            pending_local_updates: VecDeque::new(),
            focus_set: std::collections::HashSet::new(),
            handshake_started_at: None,
            sent_empty_step2: false,
            received_empty_step2: false,
        }
    }

    /// The document id this session drives (`workspace:{id}` or
    /// `body:{wsid}/{path}`).
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn push_frame(&mut self, payload: Vec<u8>) {
        self.outgoing
            .push_back(EngineOutput::Binary(frame_with_doc_id(&self.doc_id, &payload)));
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.outgoing.push_back(EngineOutput::Event(event));
    }

    fn push_text(&mut self, value: &impl Serialize) {
        if let Ok(text) = serde_json::to_string(value) {
            self.outgoing.push_back(EngineOutput::Text(text));
        }
    }

    /// The transport connected; begin the handshake by sending SyncStep1.
    pub fn on_connected(&mut self, doc: &dyn SyncDocument, now: Duration) {
        self.phase = SessionPhase::Handshake1;
        self.handshake_started_at = Some(now);
        self.sent_empty_step2 = false;
        self.received_empty_step2 = false;
        let sv = doc.state_vector();
        self.push_frame(SyncMessage::SyncStep1(sv).encode());
        self.push_event(SessionEvent::StatusChanged {
            status: "connecting".to_string(),
            error: None,
        });
    }

    /// The transport disconnected. Outgoing queues are dropped;
    /// `pending_local_updates` survives so Step1 on reconnect reconciles it.
    pub fn on_disconnected(&mut self) {
        self.outgoing.clear();
        self.phase = SessionPhase::Disconnected;
        self.handshake_started_at = None;
    }

    /// Queue a local CRDT update for broadcast.
    ///
    /// If disconnected, the update is held in `pending_local_updates`; the
    /// next `on_connected` re-sends Step1, which implicitly covers it (the
    /// peer's own Step1 response will request whatever it's missing).
    pub fn queue_local_update(&mut self, update: Vec<u8>) {
        if self.phase == SessionPhase::Disconnected {
            self.pending_local_updates.push_back(update);
            return;
        }
        self.push_frame(SyncMessage::Update(update.clone()).encode());
        self.pending_local_updates.push_back(update);
    }

    /// Feed an inbound binary sync frame (without the doc-id prefix --
    /// the caller routes by doc-id via [`unframe_doc_id`] first).
    pub fn inject_binary(&mut self, payload: &[u8], doc: &dyn SyncDocument) -> StorageResult<()> {
        if self.phase == SessionPhase::Poisoned {
            return Ok(());
        }

        let messages = SyncMessage::decode_all(payload).map_err(|e| match e {
            DiaryxError::Crdt(msg) => DiaryxError::ProtocolViolation(msg),
            other => other,
        })?;

        for msg in messages {
            match msg {
                SyncMessage::SyncStep1(remote_sv) => {
                    let diff = doc.diff(&remote_sv)?;
                    let is_empty = diff.is_empty();
                    self.push_frame(SyncMessage::SyncStep2(diff).encode());
                    self.sent_empty_step2 = is_empty;
                    if self.phase == SessionPhase::Handshake1 {
                        self.phase = SessionPhase::Handshake2;
                    }
                    self.maybe_mark_synced();
                }
                SyncMessage::SyncStep2(update) => {
                    let is_empty = update.is_empty();
                    if !is_empty {
                        self.apply_remote(doc, &update, UpdateOrigin::Sync)?;
                    }
                    self.received_empty_step2 = is_empty;
                    if matches!(self.phase, SessionPhase::Handshake1 | SessionPhase::Handshake2) {
                        self.phase = SessionPhase::Syncing;
                    }
                    self.maybe_mark_synced();
                }
                SyncMessage::Update(update) => {
                    self.apply_remote(doc, &update, UpdateOrigin::Remote)?;
                }
            }
        }

        Ok(())
    }

    fn apply_remote(
        &mut self,
        doc: &dyn SyncDocument,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> StorageResult<()> {
        match doc.apply(update, origin) {
            Ok(()) => Ok(()),
            Err(DiaryxError::IntegrityViolation(msg)) => {
                self.phase = SessionPhase::Poisoned;
                self.push_event(SessionEvent::StatusChanged {
                    status: "error".to_string(),
                    error: Some(msg.clone()),
                });
                Err(DiaryxError::IntegrityViolation(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn maybe_mark_synced(&mut self) {
        if self.phase == SessionPhase::Synced {
            return;
        }
        if self.sent_empty_step2 && self.received_empty_step2 {
            self.phase = SessionPhase::Synced;
            self.push_event(SessionEvent::StatusChanged {
                status: "synced".to_string(),
                error: None,
            });
        }
    }

    /// Feed an inbound JSON text control frame.
    pub fn inject_text(&mut self, text: &str) -> StorageResult<()> {
        let msg: ControlMessage = serde_json::from_str(text)
            .map_err(|e| DiaryxError::ProtocolViolation(format!("bad control frame: {e}")))?;

        match msg {
            ControlMessage::FileManifest {
                client_is_new,
                manifest,
            } => {
                self.phase = SessionPhase::BootstrappingFiles;
                if client_is_new {
                    self.outgoing.push_back(EngineOutput::Action(
                        SessionAction::DownloadSnapshot {
                            workspace_id: self.doc_id.clone(),
                        },
                    ));
                } else {
                    let _ = manifest;
                    self.push_text(&serde_json::json!({ "type": "FilesReady" }));
                    self.phase = SessionPhase::Syncing;
                }
            }
            ControlMessage::FilesReady => {
                self.phase = SessionPhase::Syncing;
            }
            ControlMessage::SyncProgress { completed, total } => {
                self.push_event(SessionEvent::Progress { completed, total });
            }
            ControlMessage::SyncComplete { files_synced } => {
                self.push_event(SessionEvent::SyncComplete { files_synced });
            }
            ControlMessage::FocusListChanged { files } => {
                self.push_event(SessionEvent::FocusListChanged { files });
            }
            ControlMessage::PeerJoined { peer_id } => {
                self.push_event(SessionEvent::PeerJoined { peer_id });
            }
            ControlMessage::PeerLeft { peer_id } => {
                self.push_event(SessionEvent::PeerLeft { peer_id });
            }
            ControlMessage::SessionJoined => {
                self.push_event(SessionEvent::SessionJoined);
            }
            ControlMessage::SessionEnded => {
                self.push_event(SessionEvent::SessionEnded);
            }
        }

        Ok(())
    }

    /// Signal that an externally-driven snapshot download finished
    /// importing into the backing document's storage.
    pub fn on_snapshot_imported(&mut self) {
        if self.phase == SessionPhase::BootstrappingFiles {
            self.push_text(&serde_json::json!({ "type": "FilesReady" }));
            self.phase = SessionPhase::Syncing;
        }
    }

    /// Register a body document as focused (lazy body sync): sends its own
    /// Step1 so the peer can start streaming it. Only meaningful for the
    /// workspace session, which tracks which bodies are currently wanted.
    pub fn focus(&mut self, body_doc_ids: impl IntoIterator<Item = String>) {
        let files: Vec<String> = body_doc_ids.into_iter().collect();
        for id in &files {
            self.focus_set.insert(id.clone());
        }
        self.push_text(&serde_json::json!({ "type": "focus", "files": files }));
    }

    /// Unregister focused body documents; the peer must stop forwarding
    /// updates for them (backpressure).
    pub fn unfocus(&mut self, body_doc_ids: impl IntoIterator<Item = String>) {
        let files: Vec<String> = body_doc_ids.into_iter().collect();
        for id in &files {
            self.focus_set.remove(id);
        }
        self.push_text(&serde_json::json!({ "type": "unfocus", "files": files }));
    }

    /// Currently focused body document ids.
    pub fn focused(&self) -> impl Iterator<Item = &String> {
        self.focus_set.iter()
    }

    /// Advance time. Retries a stalled handshake; has no other timers of
    /// its own per the engine's "no timers" contract -- everything else is
    /// driven by `inject_*`/`queue_local_update`.
    pub fn tick(&mut self, now: Duration, doc: &dyn SyncDocument) {
        if self.phase == SessionPhase::Poisoned || self.phase == SessionPhase::Disconnected {
            return;
        }

        let stalled = matches!(self.phase, SessionPhase::Handshake1 | SessionPhase::Handshake2)
            && self
                .handshake_started_at
                .is_some_and(|started| now.saturating_sub(started) > HANDSHAKE_RETRY);

        if stalled {
            let sv = doc.state_vector();
            self.push_frame(SyncMessage::SyncStep1(sv).encode());
            self.handshake_started_at = Some(now);
        }
    }

    /// Age out focus requests that have waited longer than
    /// [`BODY_REQUEST_TIMEOUT`] -- a no-op placeholder hook for callers that
    /// track per-focus timestamps themselves; the engine keeps no internal
    /// clock beyond the handshake retry above.
    pub fn body_request_timeout() -> Duration {
        BODY_REQUEST_TIMEOUT
    }

    /// Drain every queued outbound frame, action, and event, in the order
    /// the engine produced them.
    pub fn drain(&mut self) -> Vec<EngineOutput> {
        self.outgoing.drain(..).collect()
    }

    /// Whether this session multiplexes the workspace document or a body.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("doc_id", &self.doc_id)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

//! The `/sync2` WebSocket endpoint.
//!
//! A single socket multiplexes the workspace document and every body
//! document the client has focused, using the doc-id-prefixed binary
//! framing from [`diaryx_core::crdt::frame_with_doc_id`] plus JSON text
//! control frames. This handler plays the server side of the protocol
//! described against [`diaryx_core::crdt::Session`] on the client: it does
//! not run an engine of its own, since the relay's authoritative state lives
//! directly in the workspace/body CRDTs owned by [`crate::sync::SyncRoom`].

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use diaryx_core::crdt::{SyncMessage, frame_with_doc_id, unframe_doc_id};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::sync::{SyncRoom, SyncState};

const WORKSPACE_DOC_ID: &str = "workspace";
const BODY_DOC_PREFIX: &str = "body:";

/// Application-level, non-retriable reject (spec.md:272: 4000-4999) for a
/// frame whose shape the `/sync2` wire contract doesn't recognize.
const CLOSE_UNSUPPORTED_FRAMING: (u16, &str) = (4400, "unsupported protocol version");

/// Transient, retriable close (spec.md:272: 5xxx) issued when a broadcast
/// receiver falls far enough behind that the channel drops messages -
/// tokio's broadcast channel capacity is the high-water mark referred to in
/// spec.md:220.
const CLOSE_BACKPRESSURE: (u16, &str) = (5000, "connection fell behind and was closed");

/// Query parameters for the `/sync2` upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub session: Option<String>,
}

#[derive(Clone)]
pub struct WsState {
    pub config: Arc<Config>,
    pub sync_state: Arc<SyncState>,
}

/// Inbound JSON text control frames a client may send.
///
/// The closed `type` set (§6) mixes casing: `FilesReady` is capitalized like
/// `FileManifest`/`CrdtState`, while `focus`/`unfocus` are lowercase, so each
/// variant is renamed explicitly rather than blanket-cased.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundControl {
    FilesReady,
    #[serde(rename = "focus")]
    Focus { files: Vec<String> },
    #[serde(rename = "unfocus")]
    Unfocus { files: Vec<String> },
}

/// Outbound JSON control frames not covered by [`ControlMessage`].
///
/// Field names must match what [`diaryx_core::crdt::sync_engine`]'s client
/// `ControlMessage` parses: `manifest`, not `files`.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OutboundControl<'a> {
    FileManifest {
        client_is_new: bool,
        manifest: &'a [ManifestEntry],
    },
}

#[derive(Debug, Serialize)]
struct ManifestEntry {
    path: String,
    modified_at: i64,
}

pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let (workspace_id, read_only) = if let Some(code) = &query.session {
        match resolve_session_workspace(&state, code).await {
            Some(pair) => pair,
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    } else if let Some(token) = &query.token {
        match state.config.workspace_for_token(token) {
            Some(workspace_id) => (workspace_id, false),
            None => {
                warn!("WebSocket upgrade rejected: invalid token");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    } else {
        warn!("WebSocket upgrade rejected: missing token or session");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let session_code = query.session.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, state, workspace_id, read_only, session_code))
}

async fn resolve_session_workspace(state: &WsState, code: &str) -> Option<(String, bool)> {
    let room = state.sync_state.get_room_for_session(code).await?;
    let ctx = room.get_session_context().await?;
    Some((room.workspace_id().to_string(), ctx.read_only))
}

async fn handle_socket(
    socket: WebSocket,
    state: WsState,
    workspace_id: String,
    read_only: bool,
    session_code: Option<String>,
) {
    let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
    let room = state.sync_state.get_or_create_room(&workspace_id).await;

    info!(
        "WebSocket connected: conn={}, workspace={}, read_only={}",
        connection_id, workspace_id, read_only
    );

    if let Some(code) = &session_code {
        room.add_guest(&connection_id).await;
        debug!("guest {} joined via session {}", connection_id, code);
    }

    let (mut sink, mut stream) = socket.split();

    if session_code.is_some() {
        let _ = send_json(&mut sink, &serde_json::json!({ "type": "session_joined" })).await;
    }

    let mut workspace_rx = room.subscribe();
    let mut body_rx = room.subscribe_all_bodies();
    let mut control_rx = room.subscribe_control();

    let mut focused: HashSet<String> = HashSet::new();
    let mut awaiting_files_ready = false;
    let mut pending_step1: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some((doc_id, payload)) = unframe_doc_id(&data) {
                            let unsupported = handle_binary_frame(
                                &room,
                                &mut sink,
                                doc_id,
                                payload,
                                read_only,
                                &mut awaiting_files_ready,
                                &mut pending_step1,
                            )
                            .await;
                            if unsupported {
                                warn!("unsupported framing from {}: closing 4400", connection_id);
                                send_close(&mut sink, CLOSE_UNSUPPORTED_FRAMING).await;
                                break;
                            }
                        } else {
                            warn!("malformed frame from {}: closing 4400", connection_id);
                            send_close(&mut sink, CLOSE_UNSUPPORTED_FRAMING).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(
                            &room,
                            &mut sink,
                            &connection_id,
                            &text,
                            read_only,
                            &mut focused,
                            &mut awaiting_files_ready,
                            &mut pending_step1,
                        )
                        .await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
            msg = workspace_rx.recv() => {
                match msg {
                    Ok(bytes) => {
                        let frame = frame_with_doc_id(WORKSPACE_DOC_ID, &bytes);
                        if send_binary(&mut sink, frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("conn {} lagged {} workspace updates: closing 5000", connection_id, n);
                        send_close(&mut sink, CLOSE_BACKPRESSURE).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = body_rx.recv() => {
                match msg {
                    Ok((path, bytes)) => {
                        if focused.contains(&path) {
                            let frame = frame_with_doc_id(&format!("{BODY_DOC_PREFIX}{path}"), &bytes);
                            if send_binary(&mut sink, frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("conn {} lagged {} body updates: closing 5000", connection_id, n);
                        send_close(&mut sink, CLOSE_BACKPRESSURE).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = control_rx.recv() => {
                match msg {
                    Ok(control) => {
                        if send_json(&mut sink, &control).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("conn {} lagged {} control messages: closing 5000", connection_id, n);
                        send_close(&mut sink, CLOSE_BACKPRESSURE).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    room.unsubscribe();
    room.clear_focus(&connection_id).await;
    if session_code.is_some() {
        room.remove_guest(&connection_id).await;
    }
    info!("WebSocket disconnected: conn={}", connection_id);
}

/// Handles one unframed binary payload. Returns `true` if `doc_id` names
/// neither the workspace doc nor a body doc - the caller closes the socket
/// with [`CLOSE_UNSUPPORTED_FRAMING`] in that case.
async fn handle_binary_frame(
    room: &Arc<SyncRoom>,
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    doc_id: &str,
    payload: &[u8],
    read_only: bool,
    awaiting_files_ready: &mut bool,
    pending_step1: &mut Option<Vec<u8>>,
) -> bool {
    if read_only && is_mutating(payload) {
        warn!("dropping mutating frame on read-only session");
        return false;
    }

    if doc_id == WORKSPACE_DOC_ID {
        if *awaiting_files_ready {
            // A second workspace frame arrived before FilesReady; queue is
            // already occupied, so just apply it directly -- the relay
            // tolerates out-of-order application (§4.4 ordering note).
            if let Some(response) = room.handle_message(payload).await {
                let _ = send_binary(sink, frame_with_doc_id(WORKSPACE_DOC_ID, &response)).await;
            }
            return false;
        }

        if is_initial_step1(payload) {
            let client_is_new = step1_state_vector_is_empty(payload);
            *awaiting_files_ready = true;
            *pending_step1 = Some(payload.to_vec());

            let files: Vec<ManifestEntry> = room
                .list_active_files_summary()
                .await
                .into_iter()
                .map(|(path, modified_at)| ManifestEntry { path, modified_at })
                .collect();

            let manifest = OutboundControl::FileManifest {
                client_is_new,
                manifest: &files,
            };
            let _ = send_json(sink, &manifest).await;
            return false;
        }

        if let Some(response) = room.handle_message(payload).await {
            let _ = send_binary(sink, frame_with_doc_id(WORKSPACE_DOC_ID, &response)).await;
        }
        false
    } else if let Some(file_path) = doc_id.strip_prefix(BODY_DOC_PREFIX) {
        if let Some(response) = room.handle_body_message(file_path, payload).await {
            let _ = send_binary(
                sink,
                frame_with_doc_id(&format!("{BODY_DOC_PREFIX}{file_path}"), &response),
            )
            .await;
        }
        false
    } else {
        warn!("unknown doc-id prefix: {}", doc_id);
        true
    }
}

async fn handle_text_frame(
    room: &Arc<SyncRoom>,
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    connection_id: &str,
    text: &str,
    read_only: bool,
    focused: &mut HashSet<String>,
    awaiting_files_ready: &mut bool,
    pending_step1: &mut Option<Vec<u8>>,
) {
    let control: InboundControl = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            warn!("unrecognized control frame: {}", e);
            return;
        }
    };

    match control {
        InboundControl::FilesReady => {
            if let Some(step1) = pending_step1.take() {
                *awaiting_files_ready = false;
                if let Some(response) = room.handle_message(&step1).await {
                    let _ = send_binary(sink, frame_with_doc_id(WORKSPACE_DOC_ID, &response)).await;
                }
            }
        }
        InboundControl::Focus { files } => {
            if read_only {
                return;
            }
            for path in &files {
                if focused.insert(path.clone()) {
                    let full_state = room.get_body_full_state(path).await;
                    let _ = send_binary(
                        sink,
                        frame_with_doc_id(&format!("{BODY_DOC_PREFIX}{path}"), &full_state),
                    )
                    .await;
                }
            }
            room.update_focus(connection_id, focused.clone()).await;
        }
        InboundControl::Unfocus { files } => {
            for path in &files {
                focused.remove(path);
            }
            room.update_focus(connection_id, focused.clone()).await;
        }
    }
}

/// A Step1 message whose state vector is empty: the client has no prior
/// state and is bootstrapping from scratch.
fn step1_state_vector_is_empty(payload: &[u8]) -> bool {
    match SyncMessage::decode_all(payload) {
        Ok(msgs) => msgs
            .iter()
            .any(|m| matches!(m, SyncMessage::SyncStep1(sv) if sv.is_empty())),
        Err(_) => false,
    }
}

fn is_initial_step1(payload: &[u8]) -> bool {
    matches!(
        SyncMessage::decode_all(payload),
        Ok(msgs) if matches!(msgs.first(), Some(SyncMessage::SyncStep1(_)))
    )
}

/// Conservative check for whether a frame could mutate CRDT state: Step1 is
/// read-only (a state-vector probe); Step2/Update carry actual changes.
fn is_mutating(payload: &[u8]) -> bool {
    match SyncMessage::decode_all(payload) {
        Ok(msgs) => msgs
            .iter()
            .any(|m| !matches!(m, SyncMessage::SyncStep1(_))),
        Err(_) => false,
    }
}

async fn send_binary(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    data: Vec<u8>,
) -> Result<(), ()> {
    sink.send(Message::Binary(data.into())).await.map_err(|_| ())
}

async fn send_json(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    value: &impl Serialize,
) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Sends a close frame with the given code/reason, best-effort. The socket
/// is torn down by the caller's `break` regardless of whether this send
/// succeeds.
async fn send_close(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    (code, reason): (u16, &'static str),
) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

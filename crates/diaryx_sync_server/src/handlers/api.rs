use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Json},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::auth::authorize_request;
use crate::config::Config;
use crate::sync::{ImportMode, SyncState};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub sync_state: Arc<SyncState>,
}

/// Server status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotImportResponse {
    pub files_imported: usize,
}

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route(
            "/workspaces/{workspace_id}/snapshot",
            get(get_snapshot).post(post_snapshot),
        )
        .with_state(state)
}

/// `GET /api/status` -- public, no auth required.
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.sync_state.get_stats();
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
    })
}

/// `GET /health` -- liveness probe.
async fn get_health() -> impl IntoResponse {
    StatusCode::OK
}

fn check_auth(config: &Config, parts: &Parts, workspace_id: &str) -> Result<(), StatusCode> {
    match authorize_request(config, parts) {
        Some(id) if id == workspace_id => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// `GET /api/workspaces/{id}/snapshot` -- download a bootstrap archive.
async fn get_snapshot(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
    request: axum::extract::Request,
) -> impl IntoResponse {
    let (parts, _body) = request.into_parts();
    if let Err(status) = check_auth(&state.config, &parts, &workspace_id) {
        return status.into_response();
    }

    let room = state.sync_state.get_or_create_room(&workspace_id).await;
    match room.export_snapshot_archive().await {
        Ok(bytes) => (
            StatusCode::OK,
            [("content-type", "application/zip")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("snapshot export failed for {}: {}", workspace_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `POST /api/workspaces/{id}/snapshot?mode=replace|merge` -- upload an
/// archive, replayed through the workspace and body CRDTs.
async fn post_snapshot(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
    Query(query): Query<SnapshotQuery>,
    request: axum::extract::Request,
) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    if let Err(status) = check_auth(&state.config, &parts, &workspace_id) {
        return status.into_response();
    }

    let mode: ImportMode = match query.mode.as_deref().unwrap_or("merge").parse() {
        Ok(m) => m,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let bytes = match axum::body::to_bytes(body, 100 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let room = state.sync_state.get_or_create_room(&workspace_id).await;
    match room.import_snapshot_archive(&bytes, mode).await {
        Ok(files_imported) => Json(SnapshotImportResponse { files_imported }).into_response(),
        Err(e) => {
            tracing::warn!("snapshot import failed for {}: {}", workspace_id, e);
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

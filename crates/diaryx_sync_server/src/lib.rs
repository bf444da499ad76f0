//! Diaryx sync relay server.
//!
//! Hosts the `/sync2` WebSocket endpoint that multiplexes the workspace
//! document and every focused body document for a workspace's connected
//! devices, and the HTTP snapshot service that bootstraps new clients
//! without replaying the full causal log. Access control is a single coarse
//! per-workspace bearer token (see [`config::Config`]); there is no user,
//! device, or session database.
//!
//! ## Environment variables
//!
//! - `HOST`: server host (default: `0.0.0.0`)
//! - `PORT`: server port (default: `3030`)
//! - `DATABASE_PATH`: SQLite file for the CRDT causal log (default: `./diaryx_sync.db`)
//! - `WORKSPACE_DATA_DIR`: directory for per-workspace storage (default: `./diaryx_data`)
//! - `CORS_ORIGINS`: comma-separated list of allowed origins
//! - `WORKSPACE_TOKENS`: comma-separated `workspace_id:token` pairs

pub mod auth;
pub mod config;
pub mod handlers;
pub mod sync;

pub use config::Config;

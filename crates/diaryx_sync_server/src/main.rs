use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
};
use diaryx_sync_server::{
    Config,
    handlers::{
        api::ApiState,
        api_routes,
        ws::WsState,
        ws_handler,
    },
    sync::SyncState,
};
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "diaryx_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Diaryx Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Workspace data dir: {:?}", config.workspace_data_dir);
    info!("CORS origins: {:?}", config.cors_origins);
    info!(
        "Authorized workspaces: {}",
        config.workspace_tokens.len()
    );

    if let Err(e) = std::fs::create_dir_all(&config.workspace_data_dir) {
        error!("Failed to create workspace data directory: {}", e);
        std::process::exit(1);
    }

    let sync_state = Arc::new(SyncState::new(config.workspace_data_dir.clone()));

    let api_state = ApiState {
        config: config.clone(),
        sync_state: sync_state.clone(),
    };
    let ws_state = WsState {
        config: config.clone(),
        sync_state: sync_state.clone(),
    };

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::list(origins));

    let app = Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .route("/sync2", axum::routing::get(ws_handler).with_state(ws_state))
        .nest("/api", api_routes(api_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

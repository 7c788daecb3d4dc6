// File: syncd/src/web/server.rs
use crate::config::RpcConfig;
use crate::web::{handlers, AppState};
use anyhow::Result;
use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub async fn start_web_server(
    config: &RpcConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server running on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // === SNAPSHOT ROUTES ===
        .route("/snapshot/list", get(handlers::list_snapshots))
        .route("/snapshot/latest", get(handlers::get_latest_snapshot))
        .route(
            "/snapshot/height/{height}",
            get(handlers::get_snapshot_at_height),
        )
        .route(
            "/snapshot/{height}/{format}/chunks/{index}",
            get(handlers::get_snapshot_chunk),
        )
        // === MIGRATION ROUTES ===
        .route("/migration/metadata", get(handlers::get_migration_metadata))
        .route(
            "/migration/genesis/{format}/chunks/{index}",
            get(handlers::get_genesis_chunk),
        )
        .route(
            "/migration/changesets/{height}/metadata",
            get(handlers::get_changeset_metadata),
        )
        .route(
            "/migration/changesets/{height}/chunks/{index}",
            get(handlers::get_changeset_chunk),
        )
        // Add middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

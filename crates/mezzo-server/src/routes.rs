//! HTTP surface: HLS delivery plus the stream ops endpoints.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use mezzo_common::MezzoResult;
use mezzo_session::{Orchestrator, StreamStatus};
use std::sync::Arc;
use tower_http::services::ServeDir;

/// Build the HTTP router: /hls static delivery and /api/stream ops.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let hls_dir = orchestrator.bridge().output().dir().to_path_buf();

    Router::new()
        .route("/health", get(health))
        .route("/api/stream/status", get(stream_status))
        .route("/api/stream/start", post(stream_start))
        .route("/api/stream/stop", post(stream_stop))
        .nest_service("/hls", ServeDir::new(hls_dir))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stream_status(State(orch): State<Arc<Orchestrator>>) -> Json<StreamStatus> {
    Json(orch.stream_status().await)
}

async fn stream_start(State(orch): State<Arc<Orchestrator>>) -> MezzoResult<Json<StreamStatus>> {
    tracing::info!("Manual stream start requested");
    Ok(Json(orch.start_bridge().await?))
}

async fn stream_stop(State(orch): State<Arc<Orchestrator>>) -> Json<StreamStatus> {
    tracing::info!("Manual stream stop requested");
    Json(orch.stop_bridge().await)
}

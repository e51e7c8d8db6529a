use std::sync::Arc;

use axum::{
    extract::State, middleware as axum_middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use sb_agents::RunSummary;
use sb_telemetry::middleware::metrics_middleware;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws::ws_handler;

/// Build the HTTP + WebSocket router.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/runs", get(list_runs))
        .route("/api/agents", get(list_agents))
        .route("/metrics", get(get_metrics_prometheus))
        .route("/api/metrics/json", get(get_metrics_json))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PoolStatus {
    capacity: usize,
    free: usize,
    waiting: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    shutting_down: bool,
    pool: PoolStatus,
    active_runs: usize,
    sessions: usize,
    stt_upstreams: usize,
    tts_enabled: bool,
    tts_connected: bool,
    tts_subscribers: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let pool = state.orchestrator.pool();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        shutting_down: state.orchestrator.is_shut_down(),
        pool: PoolStatus {
            capacity: pool.capacity(),
            free: pool.free_count(),
            waiting: pool.waiting(),
        },
        active_runs: state.orchestrator.active_count(),
        sessions: state.sessions.len(),
        stt_upstreams: state.stt.upstream_count().await,
        tts_enabled: state.tts.is_enabled(),
        tts_connected: state.tts.is_connected().await,
        tts_subscribers: state.tts.subscriber_count().await,
    })
}

/// GET /api/runs: runs currently in flight.
async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunSummary>> {
    Json(state.orchestrator.active_runs())
}

/// GET /api/agents: loaded preset names.
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.orchestrator.presets().names())
}

/// GET /metrics: Prometheus text exposition format.
async fn get_metrics_prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.export_prometheus();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

/// GET /api/metrics/json: JSON format export.
async fn get_metrics_json(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.export_json())
}

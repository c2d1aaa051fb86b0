// =============================================================================
// REST API — authenticated dashboard surface
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::TradingMode;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    trading_mode: TradingMode,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(get_state))
        .route("/api/v1/positions", get(get_positions))
        .route("/api/v1/trades", get(get_trades))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn get_state(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    Json(state.current_snapshot())
}

async fn get_positions(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    Json(state.book.open_positions())
}

async fn get_trades(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    Json(state.book.recent_closed_trades(100))
}

async fn control_pause(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Paused);
    Json(ControlResponse {
        trading_mode: TradingMode::Paused,
    })
}

async fn control_resume(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Live);
    Json(ControlResponse {
        trading_mode: TradingMode::Live,
    })
}

async fn control_kill(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Killed);
    crate::trading_loop::emergency_close_all(state.clone(), std::time::Duration::from_secs(5)).await;
    Json(ControlResponse {
        trading_mode: TradingMode::Killed,
    })
}

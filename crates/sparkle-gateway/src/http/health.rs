use std::sync::Arc;

use axum::extract::State;

use crate::app::AppState;
use crate::http::{ok, ApiResult};

/// GET /health: liveness plus a coarse system summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "activeSessions": state.engine.active_sessions(),
        "breakers": state.breakers.snapshot_all(),
    })))
}

//! Reliability monitoring endpoints: error taxonomy counters, recovery
//! strategy usage, breaker states, retry budget.

use std::sync::Arc;

use axum::extract::State;
use sparkle_reliability::CircuitState;

use crate::app::AppState;
use crate::http::{ok, ApiResult};

/// GET /reliability-monitoring/dashboard
pub async fn dashboard(State(state): State<Arc<AppState>>) -> ApiResult {
    let snapshot = state.reliability_metrics.snapshot();
    Ok(ok(serde_json::json!({
        "errors": snapshot.errors_by_kind,
        "totalErrors": snapshot.total_errors,
        "recoveries": snapshot.recoveries,
        "breakers": state.breakers.snapshot_all(),
        "retryBudget": {
            "remaining": state.retry_budget.remaining(),
            "exhaustedCount": state.retry_budget.exhausted_count(),
        },
        "alerts": snapshot.alerts,
    })))
}

/// GET /reliability-monitoring/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.reliability_metrics.snapshot()))
}

/// GET /reliability-monitoring/errors
pub async fn errors(State(state): State<Arc<AppState>>) -> ApiResult {
    let snapshot = state.reliability_metrics.snapshot();
    Ok(ok(serde_json::json!({
        "byKind": snapshot.errors_by_kind,
        "total": snapshot.total_errors,
        "alerts": snapshot.alerts,
    })))
}

/// GET /reliability-monitoring/recovery
pub async fn recovery(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.reliability_metrics.snapshot().recoveries))
}

/// GET /reliability-monitoring/health: degraded when any breaker is open.
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult {
    let breakers = state.breakers.snapshot_all();
    let any_open = breakers.iter().any(|b| b.state != CircuitState::Closed);
    Ok(ok(serde_json::json!({
        "status": if any_open { "degraded" } else { "ok" },
        "breakers": breakers,
        "retryBudgetRemaining": state.retry_budget.remaining(),
    })))
}

//! Cost optimization endpoints: routing, budgets, batching, cache savings.

use std::sync::Arc;

use axum::extract::State;

use crate::app::AppState;
use crate::http::{ok, store_error, ApiResult};

/// GET /optimization/report: full savings picture.
pub async fn report(State(state): State<Arc<AppState>>) -> ApiResult {
    let cache = state.cache.stats().map_err(store_error)?;
    Ok(ok(serde_json::json!({
        "optimizer": state.optimizer.report(),
        "cache": cache,
    })))
}

/// GET /optimization/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult {
    let cache = state.cache.stats().map_err(store_error)?;
    Ok(ok(serde_json::json!({
        "routing": state.optimizer.router_stats(),
        "budget": state.optimizer.budget().status(),
        "cache": cache,
    })))
}

/// GET /optimization/routing/stats
pub async fn routing_stats(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.optimizer.router_stats()))
}

/// GET /optimization/budgets/status
pub async fn budget_status(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.optimizer.budget().status()))
}

/// GET /optimization/batching/stats
pub async fn batching_stats(State(state): State<Arc<AppState>>) -> ApiResult {
    match state.optimizer.batcher() {
        Some(batcher) => Ok(ok(serde_json::json!({
            "enabled": true,
            "stats": batcher.stats(),
        }))),
        None => Ok(ok(serde_json::json!({ "enabled": false }))),
    }
}

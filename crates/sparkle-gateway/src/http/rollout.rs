//! Shadow and canary rollout control endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use sparkle_rollout::canary::CanaryError;

use crate::app::AppState;
use crate::http::{fail, ok, store_error, ApiResult};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowStartRequest {
    pub primary_variant: String,
    pub shadow_variant: String,
    #[serde(default = "default_traffic")]
    pub traffic_percent: f64,
}

fn default_traffic() -> f64 {
    100.0
}

/// POST /reliability/shadow/start
pub async fn shadow_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ShadowStartRequest>,
) -> ApiResult {
    if state
        .store
        .get_active_version(&req.shadow_variant)
        .map_err(store_error)?
        .is_none()
    {
        return Err(fail(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("shadow variant '{}' has no active version", req.shadow_variant),
        ));
    }
    state
        .shadow
        .start(&req.primary_variant, &req.shadow_variant, req.traffic_percent);
    Ok(ok(state.shadow.status()))
}

/// POST /reliability/shadow/stop
pub async fn shadow_stop(State(state): State<Arc<AppState>>) -> ApiResult {
    state.shadow.stop();
    Ok(ok(serde_json::json!({ "stopped": true })))
}

/// POST /reliability/shadow/promote: gate on the promotion criteria, then
/// end the shadow run. Serving the winner is a variant-selection change.
pub async fn shadow_promote(State(state): State<Arc<AppState>>) -> ApiResult {
    let check = state
        .shadow
        .promotion_check()
        .map_err(store_error)?
        .ok_or_else(|| fail(StatusCode::NOT_FOUND, "NOT_FOUND", "no active shadow run"))?;
    if !check.should_promote {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "PROMOTION_BLOCKED",
            check.reasons.join("; "),
        ));
    }
    state.shadow.stop();
    Ok(ok(serde_json::json!({ "promoted": true, "check": check })))
}

/// POST /reliability/shadow/rollback: discard the candidate.
pub async fn shadow_rollback(State(state): State<Arc<AppState>>) -> ApiResult {
    state.shadow.stop();
    Ok(ok(serde_json::json!({ "rolledBack": true })))
}

/// GET /reliability/shadow/status
pub async fn shadow_status(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(serde_json::json!({
        "active": state.shadow.status().is_some(),
        "setup": state.shadow.status(),
    })))
}

/// GET /reliability/shadow/analysis
pub async fn shadow_analysis(State(state): State<Arc<AppState>>) -> ApiResult {
    let analysis = state.shadow.analysis().map_err(store_error)?;
    Ok(ok(analysis))
}

/// GET /reliability/shadow/promotion-check
pub async fn shadow_promotion_check(State(state): State<Arc<AppState>>) -> ApiResult {
    let check = state.shadow.promotion_check().map_err(store_error)?;
    Ok(ok(check))
}

fn canary_error(e: CanaryError) -> (StatusCode, Json<serde_json::Value>) {
    match &e {
        CanaryError::AlreadyActive { .. } => {
            fail(StatusCode::CONFLICT, "CANARY_CONFLICT", e.to_string())
        }
        CanaryError::NotActive => fail(StatusCode::NOT_FOUND, "NO_ACTIVE_CANARY", e.to_string()),
        CanaryError::Store(_) => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            "DATABASE_ERROR",
            "internal storage error",
        ),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStartRequest {
    pub canary_variant: String,
    pub stable_variant: Option<String>,
    #[serde(default = "bool_true")]
    pub auto_promote: bool,
    #[serde(default = "bool_true")]
    pub auto_rollback: bool,
}

fn bool_true() -> bool {
    true
}

/// POST /canary/start
pub async fn canary_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CanaryStartRequest>,
) -> ApiResult {
    let stable = req
        .stable_variant
        .clone()
        .unwrap_or_else(|| state.config.agent.default_variant.clone());
    if state
        .store
        .get_active_version(&req.canary_variant)
        .map_err(store_error)?
        .is_none()
    {
        return Err(fail(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("canary variant '{}' has no active version", req.canary_variant),
        ));
    }
    state
        .canary
        .start(&req.canary_variant, &stable, req.auto_promote, req.auto_rollback)
        .map_err(canary_error)?;
    Ok(ok(state.canary.status()))
}

/// POST /canary/stop
pub async fn canary_stop(State(state): State<Arc<AppState>>) -> ApiResult {
    state.canary.stop().map_err(canary_error)?;
    Ok(ok(serde_json::json!({ "stopped": true })))
}

/// POST /canary/promote: manual stage advance.
pub async fn canary_promote(State(state): State<Arc<AppState>>) -> ApiResult {
    let outcome = state.canary.promote().map_err(canary_error)?;
    Ok(ok(serde_json::json!({ "outcome": outcome, "status": state.canary.status() })))
}

#[derive(Deserialize)]
pub struct CanaryRollbackRequest {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "manual rollback".to_string()
}

/// POST /canary/rollback
pub async fn canary_rollback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CanaryRollbackRequest>,
) -> ApiResult {
    state.canary.rollback(&req.reason).map_err(canary_error)?;
    Ok(ok(serde_json::json!({ "rolledBack": true })))
}

/// GET /canary/status
pub async fn canary_status(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.canary.status()))
}

/// GET /canary/health: current stage health verdict.
pub async fn canary_health(State(state): State<Arc<AppState>>) -> ApiResult {
    let health = state.canary.validate().map_err(canary_error)?;
    Ok(ok(health))
}

/// GET /canary/metrics: stage counters and recent audit events.
pub async fn canary_metrics(State(state): State<Arc<AppState>>) -> ApiResult {
    let events = state.store.list_canary_events(50).map_err(store_error)?;
    Ok(ok(serde_json::json!({
        "status": state.canary.status(),
        "events": events,
    })))
}

/// GET /canary/validation: the same gate the auto-promoter uses.
pub async fn canary_validation(State(state): State<Arc<AppState>>) -> ApiResult {
    let health = state.canary.validate().map_err(canary_error)?;
    Ok(ok(serde_json::json!({
        "passed": health.healthy,
        "health": health,
    })))
}

/// GET /canary/stages: stage table and gate thresholds.
pub async fn canary_stages(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.canary.stages()))
}

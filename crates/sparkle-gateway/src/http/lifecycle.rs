//! Lifecycle endpoints: drift detection, retraining, prompt versions.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::http::{fail, lifecycle_error, ok, ApiResult};

#[derive(Deserialize)]
pub struct VariantQuery {
    pub variant: Option<String>,
}

fn variant_or_default(state: &AppState, variant: &Option<String>) -> String {
    variant
        .clone()
        .unwrap_or_else(|| state.config.agent.default_variant.clone())
}

/// GET /lifecycle/drift/detect?variant=...
pub async fn drift_detect(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VariantQuery>,
) -> ApiResult {
    let variant = variant_or_default(&state, &q.variant);
    let analysis = state.drift.detect(&variant).map_err(lifecycle_error)?;
    Ok(ok(analysis))
}

/// DELETE /lifecycle/drift/cache?variant=...
pub async fn drift_clear_cache(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VariantQuery>,
) -> ApiResult {
    state.drift.clear_cache(q.variant.as_deref());
    Ok(ok(serde_json::json!({ "cleared": true })))
}

/// GET /lifecycle/retraining/check?variant=...
pub async fn retraining_check(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VariantQuery>,
) -> ApiResult {
    let variant = variant_or_default(&state, &q.variant);
    let analysis = state.drift.detect(&variant).map_err(lifecycle_error)?;
    let verdict = state
        .retraining
        .should_retrain(&analysis)
        .map_err(lifecycle_error)?;
    Ok(ok(serde_json::json!({
        "drift": analysis,
        "shouldRetrain": verdict.should_retrain,
        "reasons": verdict.reasons,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrainingStartRequest {
    pub variant: Option<String>,
    /// Skip the drift gate; for operator-forced retraining.
    #[serde(default)]
    pub force: bool,
}

/// POST /lifecycle/retraining/start
pub async fn retraining_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetrainingStartRequest>,
) -> ApiResult {
    let variant = variant_or_default(&state, &req.variant);

    if !req.force {
        let analysis = state.drift.detect(&variant).map_err(lifecycle_error)?;
        let verdict = state
            .retraining
            .should_retrain(&analysis)
            .map_err(lifecycle_error)?;
        if !verdict.should_retrain {
            return Err(fail(
                StatusCode::BAD_REQUEST,
                "RETRAINING_NOT_NEEDED",
                verdict.reasons.join("; "),
            ));
        }
    }

    let report = state
        .retraining
        .start(&variant, state.invoker.as_ref(), &state.shadow)
        .await
        .map_err(lifecycle_error)?;
    Ok(ok(report))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrainingFinalizeRequest {
    pub session_id: String,
}

/// POST /lifecycle/retraining/finalize
pub async fn retraining_finalize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetrainingFinalizeRequest>,
) -> ApiResult {
    let report = state
        .retraining
        .finalize(&req.session_id, &state.shadow)
        .map_err(lifecycle_error)?;
    Ok(ok(report))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub variant: String,
    pub system_prompt: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Activate immediately after registering.
    #[serde(default)]
    pub activate: bool,
}

/// POST /lifecycle/versions/register
pub async fn version_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult {
    if req.system_prompt.trim().is_empty() {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "systemPrompt cannot be empty",
        ));
    }
    let version = state
        .registry
        .register(&req.variant, &req.system_prompt, req.metadata)
        .map_err(lifecycle_error)?;
    if req.activate {
        state
            .registry
            .activate(&req.variant, version)
            .map_err(lifecycle_error)?;
    }
    Ok(ok(serde_json::json!({
        "variant": req.variant,
        "version": version,
        "active": req.activate,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub variant: String,
    pub version: i64,
}

/// POST /lifecycle/versions/activate
pub async fn version_activate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActivateRequest>,
) -> ApiResult {
    state
        .registry
        .activate(&req.variant, req.version)
        .map_err(lifecycle_error)?;
    Ok(ok(serde_json::json!({
        "variant": req.variant,
        "activeVersion": req.version,
    })))
}

#[derive(Deserialize)]
pub struct RollbackRequest {
    pub variant: String,
}

/// POST /lifecycle/versions/rollback
pub async fn version_rollback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult {
    let version = state
        .registry
        .rollback(&req.variant)
        .map_err(lifecycle_error)?;
    Ok(ok(serde_json::json!({
        "variant": req.variant,
        "activeVersion": version,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRequest {
    pub variant: String,
    pub version: i64,
    pub tag: String,
    #[serde(default)]
    pub description: String,
}

/// POST /lifecycle/versions/tag
pub async fn version_tag(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TagRequest>,
) -> ApiResult {
    state
        .registry
        .tag(&req.variant, req.version, &req.tag, &req.description)
        .map_err(lifecycle_error)?;
    Ok(ok(serde_json::json!({ "tagged": true })))
}

/// GET /lifecycle/versions/active?variant=...
pub async fn version_active(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VariantQuery>,
) -> ApiResult {
    let variant = variant_or_default(&state, &q.variant);
    let active = state.registry.active(&variant).map_err(lifecycle_error)?;
    Ok(ok(active))
}

/// GET /lifecycle/versions/history?variant=...
pub async fn version_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VariantQuery>,
) -> ApiResult {
    let variant = variant_or_default(&state, &q.variant);
    let history = state.registry.history(&variant).map_err(lifecycle_error)?;
    Ok(ok(history))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareQuery {
    pub variant: String,
    pub version_a: i64,
    pub version_b: i64,
}

/// GET /lifecycle/versions/compare?variant=..&versionA=..&versionB=..
pub async fn version_compare(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CompareQuery>,
) -> ApiResult {
    let compare = state
        .registry
        .compare(&q.variant, q.version_a, q.version_b)
        .map_err(lifecycle_error)?;
    Ok(ok(compare))
}

/// GET /lifecycle/versions/diff?variant=..&versionA=..&versionB=..
pub async fn version_diff(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CompareQuery>,
) -> ApiResult {
    let diff = state
        .registry
        .diff(&q.variant, q.version_a, q.version_b)
        .map_err(lifecycle_error)?;
    Ok(ok(diff))
}

/// GET /lifecycle/versions/list: all variants with registered versions.
pub async fn version_list(State(state): State<Arc<AppState>>) -> ApiResult {
    let variants = state.registry.variants().map_err(lifecycle_error)?;
    Ok(ok(serde_json::json!({ "variants": variants })))
}

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{delete, get, post},
    Router,
};
use sparkle_cache::ResponseCache;
use sparkle_core::config::SparkleConfig;
use sparkle_cost::CostOptimizer;
use sparkle_engine::ConversationEngine;
use sparkle_lifecycle::{DriftDetector, RetrainingOrchestrator, VersionRegistry};
use sparkle_reliability::{BreakerRegistry, ReliabilityMetrics, RetryBudget};
use sparkle_rollout::{CanaryController, ShadowInvoker, ShadowRunner};
use sparkle_safety::{SafetyMetrics, SafetyPipeline};
use sparkle_store::Store;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: SparkleConfig,
    pub store: Arc<Store>,
    pub engine: Arc<ConversationEngine>,
    pub cache: Arc<ResponseCache>,
    pub optimizer: Arc<CostOptimizer>,
    pub safety: Arc<SafetyPipeline>,
    pub safety_metrics: Arc<SafetyMetrics>,
    pub reliability_metrics: Arc<ReliabilityMetrics>,
    pub breakers: Arc<BreakerRegistry>,
    pub retry_budget: Arc<RetryBudget>,
    pub shadow: Arc<ShadowRunner>,
    pub canary: Arc<CanaryController>,
    pub invoker: Arc<dyn ShadowInvoker>,
    pub drift: Arc<DriftDetector>,
    pub retraining: Arc<RetrainingOrchestrator>,
    pub registry: Arc<VersionRegistry>,
    pub started_at: Instant,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(crate::http::health::health_handler))
        // Chat surface.
        .route("/chat/start", post(crate::http::chat::start_handler))
        .route("/chat/message", post(crate::http::chat::message_handler))
        .route("/chat/book", post(crate::http::chat::book_handler))
        .route("/chat/end", post(crate::http::chat::end_handler))
        .route(
            "/chat/history/{session_id}",
            get(crate::http::chat::history_handler),
        )
        // Safety monitoring.
        .route("/safety/dashboard", get(crate::http::safety::dashboard))
        .route("/safety/metrics", get(crate::http::safety::metrics))
        .route("/safety/alerts", get(crate::http::safety::alerts))
        // Reliability monitoring.
        .route(
            "/reliability-monitoring/dashboard",
            get(crate::http::reliability::dashboard),
        )
        .route(
            "/reliability-monitoring/metrics",
            get(crate::http::reliability::metrics),
        )
        .route(
            "/reliability-monitoring/errors",
            get(crate::http::reliability::errors),
        )
        .route(
            "/reliability-monitoring/recovery",
            get(crate::http::reliability::recovery),
        )
        .route(
            "/reliability-monitoring/health",
            get(crate::http::reliability::health),
        )
        // Cost optimization.
        .route("/optimization/report", get(crate::http::optimization::report))
        .route("/optimization/metrics", get(crate::http::optimization::metrics))
        .route(
            "/optimization/routing/stats",
            get(crate::http::optimization::routing_stats),
        )
        .route(
            "/optimization/budgets/status",
            get(crate::http::optimization::budget_status),
        )
        .route(
            "/optimization/batching/stats",
            get(crate::http::optimization::batching_stats),
        )
        // Lifecycle: drift, retraining, versions.
        .route("/lifecycle/drift/detect", get(crate::http::lifecycle::drift_detect))
        .route("/lifecycle/drift/cache", delete(crate::http::lifecycle::drift_clear_cache))
        .route(
            "/lifecycle/retraining/check",
            get(crate::http::lifecycle::retraining_check),
        )
        .route(
            "/lifecycle/retraining/start",
            post(crate::http::lifecycle::retraining_start),
        )
        .route(
            "/lifecycle/retraining/finalize",
            post(crate::http::lifecycle::retraining_finalize),
        )
        .route(
            "/lifecycle/versions/register",
            post(crate::http::lifecycle::version_register),
        )
        .route(
            "/lifecycle/versions/activate",
            post(crate::http::lifecycle::version_activate),
        )
        .route(
            "/lifecycle/versions/rollback",
            post(crate::http::lifecycle::version_rollback),
        )
        .route("/lifecycle/versions/tag", post(crate::http::lifecycle::version_tag))
        .route("/lifecycle/versions/active", get(crate::http::lifecycle::version_active))
        .route(
            "/lifecycle/versions/history",
            get(crate::http::lifecycle::version_history),
        )
        .route(
            "/lifecycle/versions/compare",
            get(crate::http::lifecycle::version_compare),
        )
        .route("/lifecycle/versions/diff", get(crate::http::lifecycle::version_diff))
        .route("/lifecycle/versions/list", get(crate::http::lifecycle::version_list))
        // Shadow rollout.
        .route("/reliability/shadow/start", post(crate::http::rollout::shadow_start))
        .route("/reliability/shadow/stop", post(crate::http::rollout::shadow_stop))
        .route(
            "/reliability/shadow/promote",
            post(crate::http::rollout::shadow_promote),
        )
        .route(
            "/reliability/shadow/rollback",
            post(crate::http::rollout::shadow_rollback),
        )
        .route("/reliability/shadow/status", get(crate::http::rollout::shadow_status))
        .route(
            "/reliability/shadow/analysis",
            get(crate::http::rollout::shadow_analysis),
        )
        .route(
            "/reliability/shadow/promotion-check",
            get(crate::http::rollout::shadow_promotion_check),
        )
        // Canary rollout.
        .route("/canary/start", post(crate::http::rollout::canary_start))
        .route("/canary/stop", post(crate::http::rollout::canary_stop))
        .route("/canary/promote", post(crate::http::rollout::canary_promote))
        .route("/canary/rollback", post(crate::http::rollout::canary_rollback))
        .route("/canary/status", get(crate::http::rollout::canary_status))
        .route("/canary/health", get(crate::http::rollout::canary_health))
        .route("/canary/metrics", get(crate::http::rollout::canary_metrics))
        .route("/canary/validation", get(crate::http::rollout::canary_validation))
        .route("/canary/stages", get(crate::http::rollout::canary_stages))
        // Prometheus text exposition.
        .route("/metrics/export", get(crate::http::export::metrics_export))
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    if let Some(origin) = &state.config.gateway.cors_origin {
        let cors = match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => tower_http::cors::CorsLayer::new()
                .allow_origin(value)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
            Err(_) => tower_http::cors::CorsLayer::permissive(),
        };
        router = router.layer(cors);
    }

    router
}

//! Prometheus text exposition for all in-process counters.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::app::AppState;

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

/// GET /metrics/export
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut out = String::with_capacity(4096);

    let safety = state.safety_metrics.snapshot();
    counter(
        &mut out,
        "sparkle_safety_checks_total",
        "Input safety checks run",
        safety.checks_total,
    );
    counter(
        &mut out,
        "sparkle_safety_blocked_total",
        "Messages blocked by safety",
        safety.blocked_total,
    );
    counter(
        &mut out,
        "sparkle_safety_jailbreak_blocks_total",
        "Jailbreak attempts blocked",
        safety.jailbreak_blocks,
    );
    counter(
        &mut out,
        "sparkle_safety_pii_blocks_total",
        "Messages blocked for critical PII",
        safety.pii_blocks,
    );
    counter(
        &mut out,
        "sparkle_safety_output_leaks_total",
        "System prompt leaks sanitized",
        safety.output_leaks,
    );

    let reliability = state.reliability_metrics.snapshot();
    counter(
        &mut out,
        "sparkle_errors_total",
        "Classified operation errors",
        reliability.total_errors,
    );
    for (kind, count) in &reliability.errors_by_kind {
        let _ = writeln!(out, "sparkle_errors_by_kind_total{{kind=\"{kind}\"}} {count}");
    }
    counter(
        &mut out,
        "sparkle_recovery_primary_total",
        "Requests served by the primary path",
        reliability.recoveries.primary,
    );
    counter(
        &mut out,
        "sparkle_recovery_cached_total",
        "Requests served from the recovery cache",
        reliability.recoveries.cached,
    );
    counter(
        &mut out,
        "sparkle_recovery_degraded_total",
        "Requests served by degraded mode",
        reliability.recoveries.degraded,
    );
    counter(
        &mut out,
        "sparkle_recovery_fallback_total",
        "Requests served by the fallback value",
        reliability.recoveries.fallback,
    );

    for breaker in state.breakers.snapshot_all() {
        let _ = writeln!(
            out,
            "sparkle_breaker_open{{name=\"{}\"}} {}",
            breaker.name,
            if breaker.state == sparkle_reliability::CircuitState::Closed {
                0
            } else {
                1
            }
        );
        let _ = writeln!(
            out,
            "sparkle_breaker_error_rate{{name=\"{}\"}} {}",
            breaker.name, breaker.error_rate
        );
    }

    gauge(
        &mut out,
        "sparkle_retry_budget_remaining",
        "Retry tokens left in the rolling window",
        state.retry_budget.remaining() as f64,
    );

    if let Ok(cache) = state.cache.stats() {
        counter(
            &mut out,
            "sparkle_cache_hits_total",
            "Exact cache hits",
            cache.hits,
        );
        counter(
            &mut out,
            "sparkle_cache_similarity_hits_total",
            "Approximate cache hits",
            cache.similarity_hits,
        );
        counter(
            &mut out,
            "sparkle_cache_misses_total",
            "Cache misses",
            cache.misses,
        );
        gauge(
            &mut out,
            "sparkle_cache_entries",
            "Live cache entries",
            cache.entries as f64,
        );
        gauge(
            &mut out,
            "sparkle_cache_saved_usd",
            "Estimated USD saved by cache hits",
            cache.estimated_saved_usd,
        );
    }

    let budget = state.optimizer.budget().status();
    gauge(
        &mut out,
        "sparkle_budget_daily_spent_usd",
        "USD spent today",
        budget.daily_spent_usd,
    );
    gauge(
        &mut out,
        "sparkle_budget_monthly_spent_usd",
        "USD spent this month",
        budget.monthly_spent_usd,
    );

    gauge(
        &mut out,
        "sparkle_active_sessions",
        "Live chat sessions",
        state.engine.active_sessions() as f64,
    );
    gauge(
        &mut out,
        "sparkle_uptime_seconds",
        "Process uptime",
        state.started_at.elapsed().as_secs_f64(),
    );

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

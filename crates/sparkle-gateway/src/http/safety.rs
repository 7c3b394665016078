//! Safety monitoring endpoints.

use std::sync::Arc;

use axum::extract::State;

use crate::app::AppState;
use crate::http::{ok, store_error, ApiResult};

fn day_ago() -> String {
    (chrono::Utc::now() - chrono::Duration::hours(24)).to_rfc3339()
}

/// GET /safety/dashboard: counters plus 24h event breakdown.
pub async fn dashboard(State(state): State<Arc<AppState>>) -> ApiResult {
    let since = day_ago();
    let events = state
        .store
        .safety_event_counts(&since)
        .map_err(store_error)?;
    let pii = state.store.pii_event_counts(&since).map_err(store_error)?;
    let events_json: serde_json::Value = events
        .into_iter()
        .map(|(check, (total, blocked))| {
            (
                check,
                serde_json::json!({ "total": total, "blocked": blocked }),
            )
        })
        .collect::<serde_json::Map<String, serde_json::Value>>()
        .into();
    Ok(ok(serde_json::json!({
        "counters": state.safety_metrics.snapshot(),
        "last24h": { "events": events_json, "piiByRisk": pii },
    })))
}

/// GET /safety/metrics: raw counter snapshot.
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(ok(state.safety_metrics.snapshot()))
}

/// GET /safety/alerts: high-risk PII and block activity in the last 24h.
pub async fn alerts(State(state): State<Arc<AppState>>) -> ApiResult {
    let since = day_ago();
    let pii = state.store.pii_event_counts(&since).map_err(store_error)?;
    let snapshot = state.safety_metrics.snapshot();
    let critical = pii.get("CRITICAL").copied().unwrap_or(0);
    let high = pii.get("HIGH").copied().unwrap_or(0);
    Ok(ok(serde_json::json!({
        "criticalPii24h": critical,
        "highPii24h": high,
        "blockedTotal": snapshot.blocked_total,
        "jailbreakBlocks": snapshot.jailbreak_blocks,
        "alerting": critical > 0 || snapshot.block_rate > 0.2,
    })))
}

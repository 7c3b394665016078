//! Conversational surface: start, message, book, end, history.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use sparkle_core::Action;
use sparkle_engine::ChatOutcome;
use sparkle_rollout::ShadowReply;
use tracing::warn;
use uuid::Uuid;

use crate::app::AppState;
use crate::http::{engine_error, fail, ok, ApiResult};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub variant: Option<String>,
}

/// POST /chat/start: open a session. An active canary may claim the
/// session for its traffic share when no variant is requested explicitly.
pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> ApiResult {
    let variant = req
        .variant
        .clone()
        .or_else(|| state.canary.assign_variant(&Uuid::new_v4().to_string()));
    let started = state
        .engine
        .start_conversation(variant.as_deref())
        .map_err(engine_error)?;
    Ok(ok(serde_json::json!({
        "sessionId": started.session_id,
        "conversationId": started.conversation_id,
        "variant": started.variant,
        "welcomeMessage": started.welcome_message,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub session_id: String,
    pub message: String,
}

/// POST /chat/message: one user turn through the full pipeline.
pub async fn message_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageRequest>,
) -> ApiResult {
    if req.message.trim().is_empty() {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "message cannot be empty",
        ));
    }

    let outcome = state
        .engine
        .chat(&req.session_id, &req.message)
        .await
        .map_err(engine_error)?;

    match outcome {
        ChatOutcome::Blocked {
            check_type,
            reason,
            message,
        } => Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "success": false,
                "data": {
                    "action": "blocked",
                    "reason": reason,
                    "checkType": check_type,
                    "message": message,
                },
                "error": { "code": "SAFETY_BLOCKED", "message": reason },
            })),
        )),
        ChatOutcome::Reply(reply) => {
            // Variant attribution for canary health and shadow sampling.
            let variant = state
                .store
                .get_conversation_by_session(&req.session_id)
                .ok()
                .flatten()
                .map(|c| c.variant);
            if let Some(variant) = variant {
                let ok_outcome =
                    reply.metadata.from_cache || reply.metadata.strategy.is_none();
                state.canary.record_outcome(
                    &variant,
                    ok_outcome,
                    reply.metadata.response_time_ms.max(0) as u64,
                    reply.action == Action::BookAppointment,
                );
                state.shadow.maybe_shadow(
                    &variant,
                    &req.message,
                    &ShadowReply {
                        message: reply.message.clone(),
                        action: reply.action.as_str().to_string(),
                        duration_ms: reply.metadata.response_time_ms,
                        cost_usd: reply.metadata.cost_usd,
                    },
                );
            } else {
                warn!(session_id = %req.session_id, "variant attribution failed");
            }

            Ok(ok(serde_json::json!({
                "message": reply.message,
                "action": reply.action,
                "extractedData": reply.extracted_data,
                "metadata": {
                    "model": reply.metadata.model,
                    "tokens": reply.metadata.tokens,
                    "cost": reply.metadata.cost_usd,
                    "responseTime": reply.metadata.response_time_ms,
                    "fromCache": reply.metadata.from_cache,
                    "strategy": reply.metadata.strategy,
                },
            })))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub details: serde_json::Value,
}

/// POST /chat/book: record a completed booking on the conversation.
pub async fn book_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BookRequest>,
) -> ApiResult {
    let appointment_id = state
        .engine
        .book(&req.session_id, &req.details)
        .map_err(engine_error)?;
    Ok(ok(serde_json::json!({ "appointmentId": appointment_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRequest {
    pub session_id: String,
    #[serde(default)]
    pub satisfaction: Option<i64>,
}

/// POST /chat/end: close a session, optionally recording satisfaction.
pub async fn end_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndRequest>,
) -> ApiResult {
    if let Some(s) = req.satisfaction {
        if !(1..=5).contains(&s) {
            return Err(fail(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "satisfaction must be between 1 and 5",
            ));
        }
    }
    state
        .engine
        .end(&req.session_id, req.satisfaction)
        .map_err(engine_error)?;
    Ok(ok(serde_json::json!({ "ended": true })))
}

/// GET /chat/history/:session_id: ordered, PII-redacted transcript.
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult {
    let history = state.engine.history(&session_id).map_err(engine_error)?;
    let rows: Vec<serde_json::Value> = history
        .into_iter()
        .map(|(role, content)| serde_json::json!({ "role": role, "content": content }))
        .collect();
    Ok(ok(rows))
}

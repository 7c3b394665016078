pub mod chat;
pub mod export;
pub mod health;
pub mod lifecycle;
pub mod optimization;
pub mod reliability;
pub mod rollout;
pub mod safety;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// All JSON endpoints answer `{success, data?, error?}`.
pub type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "data": data,
    }))
}

pub fn fail(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": { "code": code, "message": message.into() },
        })),
    )
}

/// Map engine failures to HTTP status and error code.
pub fn engine_error(e: sparkle_engine::EngineError) -> (StatusCode, Json<serde_json::Value>) {
    use sparkle_engine::EngineError::*;
    match &e {
        SessionNotFound { .. } => fail(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", e.to_string()),
        SessionBusy { .. } => fail(StatusCode::CONFLICT, "SESSION_BUSY", e.to_string()),
        SessionClosed { .. } => fail(StatusCode::CONFLICT, "SESSION_CLOSED", e.to_string()),
        Capacity { .. } => fail(
            StatusCode::SERVICE_UNAVAILABLE,
            "CAPACITY_EXCEEDED",
            e.to_string(),
        ),
        NoActiveVersion { .. } => fail(StatusCode::NOT_FOUND, "NO_ACTIVE_VERSION", e.to_string()),
        BudgetExceeded(_) => fail(
            StatusCode::TOO_MANY_REQUESTS,
            "BUDGET_EXCEEDED",
            e.to_string(),
        ),
        Store(_) => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            "DATABASE_ERROR",
            "internal storage error",
        ),
    }
}

pub fn lifecycle_error(
    e: sparkle_lifecycle::LifecycleError,
) -> (StatusCode, Json<serde_json::Value>) {
    use sparkle_lifecycle::LifecycleError::*;
    match &e {
        UnknownVariant(_) | VersionNotFound { .. } | SessionNotFound(_) | NothingToRollBack(_) => {
            fail(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
        }
        RetrainingBlocked(_) | EvaluationFailed(_) => {
            fail(StatusCode::BAD_REQUEST, "RETRAINING_FAILED", e.to_string())
        }
        Store(_) => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            "DATABASE_ERROR",
            "internal storage error",
        ),
    }
}

pub fn store_error(e: sparkle_store::StoreError) -> (StatusCode, Json<serde_json::Value>) {
    match &e {
        sparkle_store::StoreError::NotFound { .. } => {
            fail(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
        }
        _ => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            "DATABASE_ERROR",
            "internal storage error",
        ),
    }
}

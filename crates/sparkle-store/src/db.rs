use rusqlite::Connection;

use crate::error::Result;

/// Initialise every table and index.
///
/// Safe to call on every startup: uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            session_id          TEXT NOT NULL UNIQUE,
            variant             TEXT NOT NULL,
            prompt_version      INTEGER NOT NULL DEFAULT 1,
            status              TEXT NOT NULL DEFAULT 'active',
            started_at          TEXT NOT NULL,
            ended_at            TEXT,
            total_messages      INTEGER NOT NULL DEFAULT 0,
            total_tokens        INTEGER NOT NULL DEFAULT 0,
            total_cost_usd      REAL NOT NULL DEFAULT 0,
            booking_completed   INTEGER NOT NULL DEFAULT 0,
            escalated_to_human  INTEGER NOT NULL DEFAULT 0,
            satisfaction        INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_variant
            ON conversations(variant, started_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id  TEXT NOT NULL,
            role             TEXT NOT NULL,
            content          TEXT NOT NULL,
            action           TEXT,
            tokens           INTEGER NOT NULL DEFAULT 0,
            cost_usd         REAL NOT NULL DEFAULT 0,
            model            TEXT,
            temperature      REAL,
            response_time_ms INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id);

        CREATE TABLE IF NOT EXISTS response_cache (
            message_hash     TEXT PRIMARY KEY,
            user_message     TEXT NOT NULL,
            variant          TEXT NOT NULL,
            response_message TEXT NOT NULL,
            response_action  TEXT NOT NULL,
            response_data    TEXT,
            model            TEXT,
            tokens           INTEGER NOT NULL DEFAULT 0,
            cost_usd         REAL NOT NULL DEFAULT 0,
            response_time_ms INTEGER NOT NULL DEFAULT 0,
            expires_at       TEXT NOT NULL,
            hit_count        INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            last_accessed    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_response_cache_variant
            ON response_cache(variant, last_accessed);

        CREATE TABLE IF NOT EXISTS safety_events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT,
            check_type      TEXT NOT NULL,
            user_message    TEXT NOT NULL,
            blocked         INTEGER NOT NULL,
            violation_type  TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_safety_events_created
            ON safety_events(created_at DESC);

        CREATE TABLE IF NOT EXISTS pii_events (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT,
            session_id     TEXT,
            source         TEXT NOT NULL,
            pii_detected   INTEGER NOT NULL,
            pii_types      TEXT NOT NULL DEFAULT '',
            risk_level     TEXT NOT NULL,
            risk_score     INTEGER NOT NULL DEFAULT 0,
            redacted_count INTEGER NOT NULL DEFAULT 0,
            message_length INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pii_events_risk
            ON pii_events(risk_level);

        CREATE TABLE IF NOT EXISTS shadow_comparisons (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            primary_variant  TEXT NOT NULL,
            shadow_variant   TEXT NOT NULL,
            primary_response TEXT NOT NULL,
            shadow_response  TEXT NOT NULL,
            primary_duration INTEGER NOT NULL DEFAULT 0,
            shadow_duration  INTEGER NOT NULL DEFAULT 0,
            primary_cost     REAL NOT NULL DEFAULT 0,
            shadow_cost      REAL NOT NULL DEFAULT 0,
            shadow_error     INTEGER NOT NULL DEFAULT 0,
            different        INTEGER NOT NULL DEFAULT 0,
            difference_score REAL NOT NULL DEFAULT 1.0,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_shadow_comparisons_pair
            ON shadow_comparisons(primary_variant, shadow_variant, created_at DESC);

        CREATE TABLE IF NOT EXISTS canary_events (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            canary_variant   TEXT NOT NULL,
            stable_variant   TEXT NOT NULL,
            stage            INTEGER NOT NULL,
            event            TEXT NOT NULL,
            reason           TEXT,
            metrics_snapshot TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS drift_detections (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            variant         TEXT NOT NULL,
            drift_types     TEXT NOT NULL DEFAULT '',
            severity        TEXT NOT NULL,
            baseline_window TEXT NOT NULL,
            recent_window   TEXT NOT NULL,
            metrics         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_drift_detections_variant
            ON drift_detections(variant, created_at DESC);

        CREATE TABLE IF NOT EXISTS retraining_sessions (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id         TEXT NOT NULL UNIQUE,
            variant            TEXT NOT NULL,
            version            INTEGER NOT NULL DEFAULT 0,
            status             TEXT NOT NULL,
            training_data_size INTEGER NOT NULL DEFAULT 0,
            failure_analysis   TEXT,
            new_variant        TEXT,
            shadow_analysis    TEXT,
            success            INTEGER NOT NULL DEFAULT 0,
            started_at         TEXT NOT NULL,
            completed_at       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_retraining_sessions_variant
            ON retraining_sessions(variant, started_at DESC);

        CREATE TABLE IF NOT EXISTS model_versions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            variant       TEXT NOT NULL,
            version       INTEGER NOT NULL,
            system_prompt TEXT NOT NULL,
            metadata      TEXT NOT NULL DEFAULT '{}',
            tags          TEXT NOT NULL DEFAULT '{}',
            is_active     INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            activated_at  TEXT,
            UNIQUE(variant, version)
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        // Index count is stable across re-runs.
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(n >= 9);
    }
}

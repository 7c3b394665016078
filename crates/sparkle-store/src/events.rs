use std::collections::HashMap;

use tracing::instrument;

use crate::error::{Result, StoreError};
use crate::types::{
    CanaryEventRow, DriftDetectionRow, NewCanaryEvent, NewDriftDetection, NewPiiEvent,
    NewSafetyEvent, NewShadowComparison, RetrainingSessionRow, ShadowComparisonRow,
};
use crate::Store;

impl Store {
    #[instrument(skip(self, ev), fields(check_type = ev.check_type, blocked = ev.blocked))]
    pub fn insert_safety_event(&self, ev: &NewSafetyEvent<'_>) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO safety_events
             (conversation_id, check_type, user_message, blocked, violation_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                ev.conversation_id,
                ev.check_type,
                ev.user_message,
                ev.blocked,
                ev.violation_type,
                now,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self, ev), fields(risk = ev.risk_level, score = ev.risk_score))]
    pub fn insert_pii_event(&self, ev: &NewPiiEvent<'_>) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO pii_events
             (conversation_id, session_id, source, pii_detected, pii_types, risk_level,
              risk_score, redacted_count, message_length, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                ev.conversation_id,
                ev.session_id,
                ev.source,
                ev.pii_detected,
                ev.pii_types,
                ev.risk_level,
                ev.risk_score,
                ev.redacted_count,
                ev.message_length,
                now,
            ],
        )?;
        Ok(())
    }

    /// Blocked / total safety event counts since a timestamp, per check type.
    pub fn safety_event_counts(&self, since: &str) -> Result<HashMap<String, (i64, i64)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT check_type, COUNT(*), SUM(blocked) FROM safety_events
             WHERE created_at >= ?1 GROUP BY check_type",
        )?;
        let rows = stmt.query_map([since], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = HashMap::new();
        for r in rows.filter_map(|r| r.ok()) {
            out.insert(r.0, (r.1, r.2));
        }
        Ok(out)
    }

    /// PII event counts grouped by risk level since a timestamp.
    pub fn pii_event_counts(&self, since: &str) -> Result<HashMap<String, i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT risk_level, COUNT(*) FROM pii_events
             WHERE created_at >= ?1 GROUP BY risk_level",
        )?;
        let rows = stmt.query_map([since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self, cmp), fields(primary = cmp.primary_variant, shadow = cmp.shadow_variant))]
    pub fn insert_shadow_comparison(&self, cmp: &NewShadowComparison<'_>) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO shadow_comparisons
             (primary_variant, shadow_variant, primary_response, shadow_response,
              primary_duration, shadow_duration, primary_cost, shadow_cost,
              shadow_error, different, difference_score, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            rusqlite::params![
                cmp.primary_variant,
                cmp.shadow_variant,
                cmp.primary_response,
                cmp.shadow_response,
                cmp.primary_duration,
                cmp.shadow_duration,
                cmp.primary_cost,
                cmp.shadow_cost,
                cmp.shadow_error,
                cmp.different,
                cmp.difference_score,
                now,
            ],
        )?;
        Ok(())
    }

    /// Most recent comparisons for a primary/shadow pair, newest first.
    pub fn shadow_comparisons(
        &self,
        primary: &str,
        shadow: &str,
        limit: usize,
    ) -> Result<Vec<ShadowComparisonRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, primary_variant, shadow_variant, primary_response, shadow_response,
                    primary_duration, shadow_duration, primary_cost, shadow_cost,
                    shadow_error, different, difference_score, created_at
             FROM shadow_comparisons
             WHERE primary_variant = ?1 AND shadow_variant = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![primary, shadow, limit as i64], |row| {
            Ok(ShadowComparisonRow {
                id: row.get(0)?,
                primary_variant: row.get(1)?,
                shadow_variant: row.get(2)?,
                primary_response: row.get(3)?,
                shadow_response: row.get(4)?,
                primary_duration: row.get(5)?,
                shadow_duration: row.get(6)?,
                primary_cost: row.get(7)?,
                shadow_cost: row.get(8)?,
                shadow_error: row.get(9)?,
                different: row.get(10)?,
                difference_score: row.get(11)?,
                created_at: row.get(12)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self, ev), fields(canary = ev.canary_variant, stage = ev.stage, event = ev.event))]
    pub fn insert_canary_event(&self, ev: &NewCanaryEvent<'_>) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO canary_events
             (canary_variant, stable_variant, stage, event, reason, metrics_snapshot, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                ev.canary_variant,
                ev.stable_variant,
                ev.stage,
                ev.event,
                ev.reason,
                ev.metrics_snapshot,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn list_canary_events(&self, limit: usize) -> Result<Vec<CanaryEventRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, canary_variant, stable_variant, stage, event, reason,
                    metrics_snapshot, created_at
             FROM canary_events ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(CanaryEventRow {
                id: row.get(0)?,
                canary_variant: row.get(1)?,
                stable_variant: row.get(2)?,
                stage: row.get(3)?,
                event: row.get(4)?,
                reason: row.get(5)?,
                metrics_snapshot: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self, det), fields(variant = det.variant, severity = det.severity))]
    pub fn insert_drift_detection(&self, det: &NewDriftDetection<'_>) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO drift_detections
             (variant, drift_types, severity, baseline_window, recent_window, metrics, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                det.variant,
                det.drift_types,
                det.severity,
                det.baseline_window,
                det.recent_window,
                det.metrics,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn recent_drift_detections(
        &self,
        variant: &str,
        limit: usize,
    ) -> Result<Vec<DriftDetectionRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, variant, drift_types, severity, baseline_window, recent_window,
                    metrics, created_at
             FROM drift_detections WHERE variant = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![variant, limit as i64], |row| {
            Ok(DriftDetectionRow {
                id: row.get(0)?,
                variant: row.get(1)?,
                drift_types: row.get(2)?,
                severity: row.get(3)?,
                baseline_window: row.get(4)?,
                recent_window: row.get(5)?,
                metrics: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Create a retraining session row in `collecting_data` state.
    pub fn insert_retraining_session(&self, session_id: &str, variant: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO retraining_sessions (session_id, variant, status, started_at)
             VALUES (?1, ?2, 'collecting_data', ?3)",
            rusqlite::params![session_id, variant, now],
        )?;
        Ok(())
    }

    /// Update a retraining session's mutable fields as the pipeline advances.
    #[allow(clippy::too_many_arguments)]
    pub fn update_retraining_session(
        &self,
        session_id: &str,
        status: &str,
        version: Option<i64>,
        training_data_size: Option<i64>,
        failure_analysis: Option<&str>,
        new_variant: Option<&str>,
        shadow_analysis: Option<&str>,
        success: Option<bool>,
    ) -> Result<()> {
        let terminal = matches!(status, "promoted" | "rolled_back" | "failed");
        let completed_at = terminal.then(|| chrono::Utc::now().to_rfc3339());
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE retraining_sessions SET
               status             = ?1,
               version            = COALESCE(?2, version),
               training_data_size = COALESCE(?3, training_data_size),
               failure_analysis   = COALESCE(?4, failure_analysis),
               new_variant        = COALESCE(?5, new_variant),
               shadow_analysis    = COALESCE(?6, shadow_analysis),
               success            = COALESCE(?7, success),
               completed_at       = COALESCE(?8, completed_at)
             WHERE session_id = ?9",
            rusqlite::params![
                status,
                version,
                training_data_size,
                failure_analysis,
                new_variant,
                shadow_analysis,
                success,
                completed_at,
                session_id,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("retraining session {session_id}"),
            });
        }
        Ok(())
    }

    pub fn get_retraining_session(&self, session_id: &str) -> Result<Option<RetrainingSessionRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_id, variant, version, status, training_data_size,
                    failure_analysis, new_variant, shadow_analysis, success,
                    started_at, completed_at
             FROM retraining_sessions WHERE session_id = ?1",
            [session_id],
            row_to_retraining,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Most recent retraining session for a variant (cooldown checks).
    pub fn last_retraining_session(&self, variant: &str) -> Result<Option<RetrainingSessionRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_id, variant, version, status, training_data_size,
                    failure_analysis, new_variant, shadow_analysis, success,
                    started_at, completed_at
             FROM retraining_sessions WHERE variant = ?1
             ORDER BY started_at DESC LIMIT 1",
            [variant],
            row_to_retraining,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }
}

fn row_to_retraining(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetrainingSessionRow> {
    Ok(RetrainingSessionRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        variant: row.get(2)?,
        version: row.get(3)?,
        status: row.get(4)?,
        training_data_size: row.get(5)?,
        failure_analysis: row.get(6)?,
        new_variant: row.get(7)?,
        shadow_analysis: row.get(8)?,
        success: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retraining_lifecycle_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.insert_retraining_session("rt-1", "baseline").unwrap();
        store
            .update_retraining_session("rt-1", "shadow_testing", Some(2), Some(120), None, None, None, None)
            .unwrap();
        store
            .update_retraining_session("rt-1", "promoted", None, None, None, None, None, Some(true))
            .unwrap();
        let row = store.get_retraining_session("rt-1").unwrap().unwrap();
        assert_eq!(row.status, "promoted");
        assert_eq!(row.version, 2);
        assert_eq!(row.training_data_size, 120);
        assert!(row.success);
        assert!(row.completed_at.is_some());
    }

    #[test]
    fn safety_counts_group_by_check() {
        let store = Store::open_in_memory().unwrap();
        for blocked in [true, false, true] {
            store
                .insert_safety_event(&NewSafetyEvent {
                    conversation_id: None,
                    check_type: "jailbreak",
                    user_message: "[redacted]",
                    blocked,
                    violation_type: blocked.then_some("jailbreak_attempt"),
                })
                .unwrap();
        }
        let counts = store.safety_event_counts("1970-01-01T00:00:00+00:00").unwrap();
        assert_eq!(counts["jailbreak"], (3, 2));
    }
}

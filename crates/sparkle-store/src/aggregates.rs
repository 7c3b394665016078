use std::collections::HashMap;

use serde::Serialize;

use crate::error::Result;
use crate::Store;

/// Aggregate quality metrics for a variant over one time window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub conversations: u64,
    pub booking_rate: f64,
    pub escalation_rate: f64,
    pub avg_cost_usd: f64,
    pub avg_response_time_ms: f64,
    /// Assistant-action frequencies within the window.
    pub action_counts: HashMap<String, u64>,
}

/// Per-version aggregates backing the version compare endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct VersionMetrics {
    pub conversations: u64,
    pub booking_rate: f64,
    pub escalation_rate: f64,
    pub avg_cost_usd: f64,
    pub avg_messages: f64,
    pub avg_satisfaction: Option<f64>,
}

impl Store {
    /// Conversation-level means plus assistant response-time mean and action
    /// histogram for `variant` between two RFC 3339 timestamps.
    pub fn conversation_window_stats(
        &self,
        variant: &str,
        from: &str,
        to: &str,
    ) -> Result<WindowStats> {
        let db = self.db.lock().unwrap();
        let (conversations, booking_rate, escalation_rate, avg_cost_usd) = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(booking_completed), 0.0),
                    COALESCE(AVG(escalated_to_human), 0.0),
                    COALESCE(AVG(total_cost_usd), 0.0)
             FROM conversations
             WHERE variant = ?1 AND started_at >= ?2 AND started_at < ?3",
            rusqlite::params![variant, from, to],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            },
        )?;

        let avg_response_time_ms: f64 = db.query_row(
            "SELECT COALESCE(AVG(m.response_time_ms), 0.0)
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.variant = ?1 AND m.role = 'assistant'
               AND m.created_at >= ?2 AND m.created_at < ?3",
            rusqlite::params![variant, from, to],
            |row| row.get(0),
        )?;

        let mut stmt = db.prepare(
            "SELECT m.action, COUNT(*)
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.variant = ?1 AND m.role = 'assistant' AND m.action IS NOT NULL
               AND m.created_at >= ?2 AND m.created_at < ?3
             GROUP BY m.action",
        )?;
        let rows = stmt.query_map(rusqlite::params![variant, from, to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let action_counts: HashMap<String, u64> = rows.filter_map(|r| r.ok()).collect();

        Ok(WindowStats {
            conversations,
            booking_rate,
            escalation_rate,
            avg_cost_usd,
            avg_response_time_ms,
            action_counts,
        })
    }

    /// Assistant response times for `variant` since a timestamp, for
    /// percentile computation by callers. Bounded by `limit`.
    pub fn response_times_since(
        &self,
        variant: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.response_time_ms
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.variant = ?1 AND m.role = 'assistant' AND m.created_at >= ?2
             ORDER BY m.created_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![variant, since, limit as i64], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Aggregates over all conversations recorded for `(variant, version)`.
    pub fn version_metrics(&self, variant: &str, version: i64) -> Result<VersionMetrics> {
        let db = self.db.lock().unwrap();
        let row = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(booking_completed), 0.0),
                    COALESCE(AVG(escalated_to_human), 0.0),
                    COALESCE(AVG(total_cost_usd), 0.0),
                    COALESCE(AVG(total_messages), 0.0),
                    AVG(satisfaction)
             FROM conversations
             WHERE variant = ?1 AND prompt_version = ?2",
            rusqlite::params![variant, version],
            |row| {
                Ok(VersionMetrics {
                    conversations: row.get::<_, i64>(0)? as u64,
                    booking_rate: row.get(1)?,
                    escalation_rate: row.get(2)?,
                    avg_cost_usd: row.get(3)?,
                    avg_messages: row.get(4)?,
                    avg_satisfaction: row.get(5)?,
                })
            },
        )?;
        Ok(row)
    }

    /// Total LLM spend recorded on messages since a timestamp. Seeds the
    /// budget manager's calendar counters at startup.
    pub fn total_cost_since(&self, since: &str) -> Result<f64> {
        let db = self.db.lock().unwrap();
        let total = db.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM messages WHERE created_at >= ?1",
            [since],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Booking rate for a variant since a timestamp (canary baseline).
    pub fn booking_rate_since(&self, variant: &str, since: &str) -> Result<(u64, f64)> {
        let db = self.db.lock().unwrap();
        let row = db.query_row(
            "SELECT COUNT(*), COALESCE(AVG(booking_completed), 0.0)
             FROM conversations WHERE variant = ?1 AND started_at >= ?2",
            rusqlite::params![variant, since],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)?)),
        )?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewMessage;

    fn seed_conversation(store: &Store, session: &str, booked: bool, escalated: bool, cost: f64) {
        let id = store.insert_conversation(session, "baseline", 1).unwrap();
        store.update_conversation_rolling(&id, 2, 100, cost).unwrap();
        if booked {
            store.set_booking_completed(&id).unwrap();
        }
        if escalated {
            store.set_escalated(&id).unwrap();
        }
        store
            .insert_message(&NewMessage {
                conversation_id: &id,
                role: "assistant",
                content: "ok",
                action: Some(if booked { "book_appointment" } else { "collect_info" }),
                tokens: 50,
                cost_usd: cost,
                model: Some("fast"),
                temperature: None,
                response_time_ms: 200,
            })
            .unwrap();
    }

    #[test]
    fn window_stats_compute_means_and_histogram() {
        let store = Store::open_in_memory().unwrap();
        seed_conversation(&store, "s1", true, false, 0.002);
        seed_conversation(&store, "s2", false, true, 0.004);
        let stats = store
            .conversation_window_stats(
                "baseline",
                "1970-01-01T00:00:00+00:00",
                "2999-01-01T00:00:00+00:00",
            )
            .unwrap();
        assert_eq!(stats.conversations, 2);
        assert!((stats.booking_rate - 0.5).abs() < 1e-9);
        assert!((stats.escalation_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.action_counts["book_appointment"], 1);
        assert_eq!(stats.action_counts["collect_info"], 1);
        assert!((stats.avg_response_time_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_returns_zeroes() {
        let store = Store::open_in_memory().unwrap();
        let stats = store
            .conversation_window_stats(
                "ghost",
                "1970-01-01T00:00:00+00:00",
                "2999-01-01T00:00:00+00:00",
            )
            .unwrap();
        assert_eq!(stats.conversations, 0);
        assert_eq!(stats.booking_rate, 0.0);
    }
}

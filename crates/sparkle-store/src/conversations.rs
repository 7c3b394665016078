use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::{Conversation, ConversationStatus};
use crate::Store;

const CONVERSATION_COLS: &str = "id, session_id, variant, prompt_version, status, started_at,
    ended_at, total_messages, total_tokens, total_cost_usd, booking_completed,
    escalated_to_human, satisfaction";

impl Store {
    /// Create a conversation row for a fresh session. Returns the new id.
    #[instrument(skip(self))]
    pub fn insert_conversation(
        &self,
        session_id: &str,
        variant: &str,
        prompt_version: i64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (id, session_id, variant, prompt_version, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            rusqlite::params![id, session_id, variant, prompt_version, now],
        )?;
        Ok(id)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1");
        match db.query_row(&sql, [id], row_to_conversation) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn get_conversation_by_session(&self, session_id: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE session_id = ?1");
        match db.query_row(&sql, [session_id], row_to_conversation) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Add one turn's message/token/cost deltas to the rolling sums.
    ///
    /// A single UPDATE keeps the sums consistent with the message rows under
    /// the per-session writer discipline.
    #[instrument(skip(self))]
    pub fn update_conversation_rolling(
        &self,
        id: &str,
        message_delta: i64,
        token_delta: i64,
        cost_delta: f64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations
             SET total_messages = total_messages + ?1,
                 total_tokens   = total_tokens   + ?2,
                 total_cost_usd = total_cost_usd + ?3
             WHERE id = ?4",
            rusqlite::params![message_delta, token_delta, cost_delta, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("conversation {id}"),
            });
        }
        Ok(())
    }

    /// Transition a conversation to a status. Terminal statuses set
    /// `ended_at`; re-activating clears it.
    #[instrument(skip(self))]
    pub fn set_conversation_status(&self, id: &str, status: ConversationStatus) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let ended_at = status.is_terminal().then_some(now.as_str());
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations SET status = ?1, ended_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), ended_at, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("conversation {id}"),
            });
        }
        Ok(())
    }

    pub fn set_booking_completed(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET booking_completed = 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn set_escalated(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET escalated_to_human = 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn set_satisfaction(&self, id: &str, satisfaction: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET satisfaction = ?1 WHERE id = ?2",
            rusqlite::params![satisfaction, id],
        )?;
        Ok(())
    }

    /// Recent conversations for a variant, newest first. Used by retraining
    /// data collection.
    pub fn recent_conversations(&self, variant: &str, limit: usize) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {CONVERSATION_COLS} FROM conversations
             WHERE variant = ?1 ORDER BY started_at DESC LIMIT ?2"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![variant, limit as i64],
            row_to_conversation,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Count of conversations currently marked active.
    pub fn active_conversation_count(&self) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row(
            "SELECT COUNT(*) FROM conversations WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status_str: String = row.get(4)?;
    Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        variant: row.get(2)?,
        prompt_version: row.get(3)?,
        status: status_str.parse().unwrap_or(ConversationStatus::Active),
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        total_messages: row.get(7)?,
        total_tokens: row.get(8)?,
        total_cost_usd: row.get(9)?,
        booking_completed: row.get(10)?,
        escalated_to_human: row.get(11)?,
        satisfaction: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_conversation("sess-1", "baseline", 1).unwrap();
        let c = store.get_conversation_by_session("sess-1").unwrap().unwrap();
        assert_eq!(c.id, id);
        assert_eq!(c.variant, "baseline");
        assert_eq!(c.status, ConversationStatus::Active);
        assert!(c.ended_at.is_none());
    }

    #[test]
    fn rolling_sums_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_conversation("sess-2", "baseline", 1).unwrap();
        store.update_conversation_rolling(&id, 2, 120, 0.004).unwrap();
        store.update_conversation_rolling(&id, 2, 80, 0.002).unwrap();
        let c = store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(c.total_messages, 4);
        assert_eq!(c.total_tokens, 200);
        assert!((c.total_cost_usd - 0.006).abs() < 1e-9);
    }

    #[test]
    fn terminal_status_sets_ended_at() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_conversation("sess-3", "baseline", 1).unwrap();
        store
            .set_conversation_status(&id, ConversationStatus::Completed)
            .unwrap();
        let c = store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(c.status, ConversationStatus::Completed);
        assert!(c.ended_at.is_some());
    }

    #[test]
    fn missing_conversation_errors() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.update_conversation_rolling("nope", 1, 1, 0.0).is_err());
    }
}

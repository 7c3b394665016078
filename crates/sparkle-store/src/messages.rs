use tracing::instrument;

use crate::error::Result;
use crate::types::{MessageRow, NewMessage};
use crate::Store;

impl Store {
    /// Append a message. Ordering is the autoincrement row id; `created_at`
    /// is assigned here so it is monotone under the per-session writer.
    #[instrument(skip(self, msg), fields(conversation_id = msg.conversation_id, role = msg.role))]
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages
             (conversation_id, role, content, action, tokens, cost_usd, model,
              temperature, response_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                msg.conversation_id,
                msg.role,
                msg.content,
                msg.action,
                msg.tokens,
                msg.cost_usd,
                msg.model,
                msg.temperature,
                msg.response_time_ms,
                now,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Full ordered history for a conversation, oldest first.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, action, tokens, cost_usd,
                    model, temperature, response_time_ms, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([conversation_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn message_count(&self, conversation_id: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        action: row.get(4)?,
        tokens: row.get(5)?,
        cost_usd: row.get(6)?,
        model: row.get(7)?,
        temperature: row.get(8)?,
        response_time_ms: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &Store) -> String {
        store.insert_conversation("sess-m", "baseline", 1).unwrap()
    }

    #[test]
    fn messages_keep_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        let conv = seed(&store);
        for (i, content) in ["hi", "hello", "book me"].iter().enumerate() {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            store
                .insert_message(&NewMessage {
                    conversation_id: &conv,
                    role,
                    content,
                    action: None,
                    tokens: 10,
                    cost_usd: 0.0001,
                    model: Some("fast"),
                    temperature: Some(0.7),
                    response_time_ms: 5,
                })
                .unwrap();
        }
        let msgs = store.list_messages(&conv).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "hi");
        assert_eq!(msgs[2].content, "book me");
        assert!(msgs.windows(2).all(|w| w[0].id < w[1].id));
    }
}

use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::types::CacheRow;
use crate::Store;

const CACHE_COLS: &str = "message_hash, user_message, variant, response_message,
    response_action, response_data, model, tokens, cost_usd, response_time_ms,
    expires_at, hit_count, created_at, last_accessed";

impl Store {
    /// Insert or replace a cache entry keyed by its message hash.
    #[instrument(skip(self, row), fields(hash = %row.message_hash, variant = %row.variant))]
    pub fn upsert_cache_entry(&self, row: &CacheRow) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO response_cache
             (message_hash, user_message, variant, response_message, response_action,
              response_data, model, tokens, cost_usd, response_time_ms, expires_at,
              hit_count, created_at, last_accessed)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(message_hash) DO UPDATE SET
               response_message = excluded.response_message,
               response_action  = excluded.response_action,
               response_data    = excluded.response_data,
               model            = excluded.model,
               tokens           = excluded.tokens,
               cost_usd         = excluded.cost_usd,
               response_time_ms = excluded.response_time_ms,
               expires_at       = excluded.expires_at,
               last_accessed    = excluded.last_accessed",
            rusqlite::params![
                row.message_hash,
                row.user_message,
                row.variant,
                row.response_message,
                row.response_action,
                row.response_data,
                row.model,
                row.tokens,
                row.cost_usd,
                row.response_time_ms,
                row.expires_at,
                row.hit_count,
                row.created_at,
                row.last_accessed,
            ],
        )?;
        Ok(())
    }

    /// Fetch an entry by exact hash. Expired entries are not returned.
    pub fn get_cache_entry(&self, hash: &str) -> Result<Option<CacheRow>> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {CACHE_COLS} FROM response_cache
             WHERE message_hash = ?1 AND expires_at > ?2"
        );
        match db.query_row(&sql, rusqlite::params![hash, now], row_to_cache) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Record a hit: bump `hit_count` and refresh `last_accessed`.
    pub fn touch_cache_entry(&self, hash: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE response_cache
             SET hit_count = hit_count + 1, last_accessed = ?1
             WHERE message_hash = ?2",
            rusqlite::params![now, hash],
        )?;
        Ok(())
    }

    /// Unexpired entries for a variant, most recently created first. Feeds
    /// the similarity scan.
    pub fn recent_cache_entries(&self, variant: &str, limit: usize) -> Result<Vec<CacheRow>> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {CACHE_COLS} FROM response_cache
             WHERE variant = ?1 AND expires_at > ?2
             ORDER BY created_at DESC LIMIT ?3"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![variant, now, limit as i64], row_to_cache)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn delete_expired_cache(&self) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM response_cache WHERE expires_at <= ?1", [&now])?;
        if n > 0 {
            debug!(removed = n, "expired cache entries swept");
        }
        Ok(n)
    }

    pub fn cache_count(&self) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Evict the `count` least-recently-accessed entries.
    #[instrument(skip(self))]
    pub fn evict_lru_cache(&self, count: usize) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM response_cache WHERE message_hash IN (
                SELECT message_hash FROM response_cache
                ORDER BY last_accessed ASC LIMIT ?1
             )",
            [count as i64],
        )?;
        Ok(n)
    }

    /// Clear entries for one variant, or everything when `variant` is None.
    pub fn clear_cache(&self, variant: Option<&str>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = match variant {
            Some(v) => db.execute("DELETE FROM response_cache WHERE variant = ?1", [v])?,
            None => db.execute("DELETE FROM response_cache", [])?,
        };
        Ok(n)
    }

    /// Sum of hit counts across live entries (dashboard metric).
    pub fn cache_hit_total(&self) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row(
            "SELECT COALESCE(SUM(hit_count), 0) FROM response_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_cache(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        message_hash: row.get(0)?,
        user_message: row.get(1)?,
        variant: row.get(2)?,
        response_message: row.get(3)?,
        response_action: row.get(4)?,
        response_data: row.get(5)?,
        model: row.get(6)?,
        tokens: row.get(7)?,
        cost_usd: row.get(8)?,
        response_time_ms: row.get(9)?,
        expires_at: row.get(10)?,
        hit_count: row.get(11)?,
        created_at: row.get(12)?,
        last_accessed: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, variant: &str, expires_in_secs: i64) -> CacheRow {
        let now = chrono::Utc::now();
        CacheRow {
            message_hash: hash.to_string(),
            user_message: "need a deep clean".to_string(),
            variant: variant.to_string(),
            response_message: "happy to help".to_string(),
            response_action: "collect_info".to_string(),
            response_data: None,
            model: Some("fast".to_string()),
            tokens: 40,
            cost_usd: 0.0002,
            response_time_ms: 120,
            expires_at: (now + chrono::Duration::seconds(expires_in_secs)).to_rfc3339(),
            hit_count: 0,
            created_at: now.to_rfc3339(),
            last_accessed: now.to_rfc3339(),
        }
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_cache_entry(&entry("h1", "baseline", -5)).unwrap();
        assert!(store.get_cache_entry("h1").unwrap().is_none());
        store.upsert_cache_entry(&entry("h2", "baseline", 60)).unwrap();
        assert!(store.get_cache_entry("h2").unwrap().is_some());
    }

    #[test]
    fn touch_increments_hit_count() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_cache_entry(&entry("h3", "baseline", 60)).unwrap();
        store.touch_cache_entry("h3").unwrap();
        store.touch_cache_entry("h3").unwrap();
        let row = store.get_cache_entry("h3").unwrap().unwrap();
        assert_eq!(row.hit_count, 2);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_cache_entry(&entry("dead", "a", -1)).unwrap();
        store.upsert_cache_entry(&entry("live", "a", 60)).unwrap();
        assert_eq!(store.delete_expired_cache().unwrap(), 1);
        assert_eq!(store.cache_count().unwrap(), 1);
    }

    #[test]
    fn clear_by_variant_is_scoped() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_cache_entry(&entry("a1", "a", 60)).unwrap();
        store.upsert_cache_entry(&entry("b1", "b", 60)).unwrap();
        assert_eq!(store.clear_cache(Some("a")).unwrap(), 1);
        assert_eq!(store.cache_count().unwrap(), 1);
        assert_eq!(store.clear_cache(None).unwrap(), 1);
    }
}

use tracing::{info, instrument};

use crate::error::{Result, StoreError};
use crate::types::ModelVersion;
use crate::Store;

const VERSION_COLS: &str =
    "variant, version, system_prompt, metadata, tags, is_active, created_at, activated_at";

impl Store {
    /// Register the next version for a variant. Versions are assigned
    /// sequentially by the store; the first registration gets version 1.
    #[instrument(skip(self, system_prompt, metadata))]
    pub fn register_version(
        &self,
        variant: &str,
        system_prompt: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let meta = serde_json::to_string(metadata)?;
        let db = self.db.lock().unwrap();
        let next: i64 = db.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM model_versions WHERE variant = ?1",
            [variant],
            |row| row.get(0),
        )?;
        db.execute(
            "INSERT INTO model_versions (variant, version, system_prompt, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![variant, next, system_prompt, meta, now],
        )?;
        info!(variant, version = next, "prompt version registered");
        Ok(next)
    }

    /// Activate one version, deactivating every other version of the same
    /// variant in the same transaction.
    #[instrument(skip(self))]
    pub fn activate_version(&self, variant: &str, version: i64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let n = tx.execute(
            "UPDATE model_versions SET is_active = 1, activated_at = ?1
             WHERE variant = ?2 AND version = ?3",
            rusqlite::params![now, variant, version],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("version {version} of variant {variant}"),
            });
        }
        tx.execute(
            "UPDATE model_versions SET is_active = 0
             WHERE variant = ?1 AND version != ?2",
            rusqlite::params![variant, version],
        )?;
        tx.commit()?;
        info!(variant, version, "prompt version activated");
        Ok(())
    }

    pub fn get_active_version(&self, variant: &str) -> Result<Option<ModelVersion>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {VERSION_COLS} FROM model_versions
             WHERE variant = ?1 AND is_active = 1"
        );
        match db.query_row(&sql, [variant], row_to_version) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn get_version(&self, variant: &str, version: i64) -> Result<Option<ModelVersion>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {VERSION_COLS} FROM model_versions
             WHERE variant = ?1 AND version = ?2"
        );
        match db.query_row(&sql, rusqlite::params![variant, version], row_to_version) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// All versions of a variant, newest first.
    pub fn list_versions(&self, variant: &str) -> Result<Vec<ModelVersion>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {VERSION_COLS} FROM model_versions
             WHERE variant = ?1 ORDER BY version DESC"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([variant], row_to_version)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Variants that have at least one registered version.
    pub fn list_variants(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT DISTINCT variant FROM model_versions ORDER BY variant")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Add or overwrite a tag on a version. Idempotent.
    #[instrument(skip(self, description))]
    pub fn tag_version(
        &self,
        variant: &str,
        version: i64,
        tag: &str,
        description: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let tags_json: String = db
            .query_row(
                "SELECT tags FROM model_versions WHERE variant = ?1 AND version = ?2",
                rusqlite::params![variant, version],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    what: format!("version {version} of variant {variant}"),
                },
                other => StoreError::Database(other),
            })?;
        let mut tags: serde_json::Value =
            serde_json::from_str(&tags_json).unwrap_or_else(|_| serde_json::json!({}));
        tags[tag] = serde_json::Value::String(description.to_string());
        db.execute(
            "UPDATE model_versions SET tags = ?1 WHERE variant = ?2 AND version = ?3",
            rusqlite::params![serde_json::to_string(&tags)?, variant, version],
        )?;
        Ok(())
    }

    pub fn max_version(&self, variant: &str) -> Result<Option<i64>> {
        let db = self.db.lock().unwrap();
        let v: Option<i64> = db.query_row(
            "SELECT MAX(version) FROM model_versions WHERE variant = ?1",
            [variant],
            |row| row.get(0),
        )?;
        Ok(v)
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelVersion> {
    let meta_str: String = row.get(3)?;
    let tags_str: String = row.get(4)?;
    Ok(ModelVersion {
        variant: row.get(0)?,
        version: row.get(1)?,
        system_prompt: row.get(2)?,
        metadata: serde_json::from_str(&meta_str).unwrap_or_else(|_| serde_json::json!({})),
        tags: serde_json::from_str(&tags_str).unwrap_or_else(|_| serde_json::json!({})),
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        activated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_sequential() {
        let store = Store::open_in_memory().unwrap();
        let meta = serde_json::json!({});
        assert_eq!(store.register_version("baseline", "p1", &meta).unwrap(), 1);
        assert_eq!(store.register_version("baseline", "p2", &meta).unwrap(), 2);
        assert_eq!(store.register_version("pro", "p1", &meta).unwrap(), 1);
    }

    #[test]
    fn at_most_one_active_version_per_variant() {
        let store = Store::open_in_memory().unwrap();
        let meta = serde_json::json!({});
        store.register_version("baseline", "p1", &meta).unwrap();
        store.register_version("baseline", "p2", &meta).unwrap();
        store.activate_version("baseline", 1).unwrap();
        store.activate_version("baseline", 2).unwrap();
        let versions = store.list_versions("baseline").unwrap();
        let active: Vec<_> = versions.iter().filter(|v| v.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 2);
    }

    #[test]
    fn activate_then_rollback_then_reactivate_is_stable() {
        let store = Store::open_in_memory().unwrap();
        let meta = serde_json::json!({});
        store.register_version("v", "p1", &meta).unwrap();
        store.register_version("v", "p2", &meta).unwrap();
        store.activate_version("v", 2).unwrap();
        store.activate_version("v", 1).unwrap();
        store.activate_version("v", 2).unwrap();
        let active = store.get_active_version("v").unwrap().unwrap();
        assert_eq!(active.version, 2);
    }

    #[test]
    fn tagging_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let meta = serde_json::json!({});
        store.register_version("v", "p1", &meta).unwrap();
        store.tag_version("v", 1, "stable", "known good").unwrap();
        store.tag_version("v", 1, "stable", "known good").unwrap();
        let ver = store.get_version("v", 1).unwrap().unwrap();
        assert_eq!(ver.tags["stable"], "known good");
    }

    #[test]
    fn activating_missing_version_fails() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.activate_version("ghost", 1).is_err());
    }
}

pub mod aggregates;
pub mod cache;
pub mod conversations;
pub mod db;
pub mod error;
pub mod events;
pub mod messages;
pub mod types;
pub mod versions;

use std::sync::Mutex;

use rusqlite::Connection;

pub use error::{Result, StoreError};
pub use types::*;

/// Durable local store for conversations, messages, cache entries, safety
/// and lifecycle events, and prompt versions.
///
/// Wraps a single SQLite connection in a `Mutex`. For high-concurrency
/// deployments consider a connection pool, but a Mutex is sufficient for the
/// single-node target.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and run the idempotent schema init.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Init(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store init error: {0}")]
    Init(String),

    #[error("Row not found: {what}")]
    NotFound { what: String },

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session is processing another message: {session_id}")]
    SessionBusy { session_id: String },

    #[error("session is closed: {session_id}")]
    SessionClosed { session_id: String },

    #[error("session capacity exceeded (max {max})")]
    Capacity { max: usize },

    #[error("no active prompt version for variant '{variant}'")]
    NoActiveVersion { variant: String },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("store error: {0}")]
    Store(#[from] sparkle_store::StoreError),
}

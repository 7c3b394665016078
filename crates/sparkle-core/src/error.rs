use thiserror::Error;

/// Workspace-level error for configuration and process-setup failures.
/// Subsystems carry their own error types; this one covers the pieces that
/// run before any subsystem exists.
#[derive(Debug, Error)]
pub enum SparkleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SparkleError {
    /// Short error code string carried in JSON error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            SparkleError::Config(_) => "CONFIG_ERROR",
            SparkleError::Serialization(_) => "SERIALIZATION_ERROR",
            SparkleError::Io(_) => "IO_ERROR",
            SparkleError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SparkleError>;

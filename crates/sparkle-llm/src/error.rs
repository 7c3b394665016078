use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing API credential")]
    MissingCredential,

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// True when the transport layer never produced a usable response.
    pub fn is_transport(&self) -> bool {
        matches!(self, LlmError::Http(_) | LlmError::Unavailable(_))
    }
}

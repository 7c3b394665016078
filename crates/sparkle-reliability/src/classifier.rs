use std::fmt;

use serde::Serialize;
use sparkle_llm::LlmError;
use thiserror::Error;

/// Typed error carried through the retry/breaker/recovery stack.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("Retry budget exhausted")]
    RetryBudgetExhausted,

    #[error("{0}")]
    Other(String),
}

/// Error taxonomy. Every raw failure maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    NetworkRefused,
    NetworkDns,
    ApiRateLimit,
    ApiAuth,
    ApiInvalid,
    ApiServer,
    ApiUnavailable,
    CircuitOpen,
    Validation,
    Database,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::NetworkRefused => "network_refused",
            ErrorKind::NetworkDns => "network_dns",
            ErrorKind::ApiRateLimit => "api_rate_limit",
            ErrorKind::ApiAuth => "api_auth",
            ErrorKind::ApiInvalid => "api_invalid",
            ErrorKind::ApiServer => "api_server",
            ErrorKind::ApiUnavailable => "api_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Validation => "validation",
            ErrorKind::Database => "database",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of classifying one raw error.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub priority: Priority,
    /// Safe to show to an end user verbatim.
    pub user_message: String,
    /// Multiplies the retry policy's computed delay.
    pub backoff_multiplier: f64,
    pub alert_admin: bool,
}

const USER_MSG_TRANSIENT: &str =
    "I'm having a little trouble right now. Give me a second and try again.";
const USER_MSG_BUSY: &str =
    "We're handling a lot of requests right now. Please try again in a moment.";
const USER_MSG_HUMAN: &str =
    "I'm having trouble on my end — let me connect you with a human who can help.";
const USER_MSG_INVALID: &str =
    "I couldn't process that message. Could you rephrase it?";

/// Maps raw errors onto the taxonomy. Stateless; one instance per process.
#[derive(Debug, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, err: &OperationError) -> Classification {
        let kind = self.kind_of(err);
        self.entry(kind)
    }

    /// The static taxonomy entry for a kind.
    pub fn entry(&self, kind: ErrorKind) -> Classification {
        let (retryable, priority, user_message, backoff_multiplier, alert_admin) = match kind {
            ErrorKind::NetworkTimeout => (true, Priority::High, USER_MSG_TRANSIENT, 1.0, false),
            ErrorKind::NetworkRefused => (true, Priority::High, USER_MSG_TRANSIENT, 1.0, false),
            ErrorKind::NetworkDns => (true, Priority::Critical, USER_MSG_HUMAN, 2.0, true),
            ErrorKind::ApiRateLimit => (true, Priority::Medium, USER_MSG_BUSY, 3.0, false),
            ErrorKind::ApiAuth => (false, Priority::Critical, USER_MSG_HUMAN, 1.0, true),
            ErrorKind::ApiInvalid => (false, Priority::Low, USER_MSG_INVALID, 1.0, false),
            ErrorKind::ApiServer => (true, Priority::High, USER_MSG_TRANSIENT, 1.5, true),
            ErrorKind::ApiUnavailable => (true, Priority::High, USER_MSG_BUSY, 2.0, true),
            ErrorKind::CircuitOpen => (false, Priority::High, USER_MSG_HUMAN, 1.0, true),
            ErrorKind::Validation => (false, Priority::Low, USER_MSG_INVALID, 1.0, false),
            ErrorKind::Database => (true, Priority::Critical, USER_MSG_HUMAN, 1.5, true),
            ErrorKind::Unknown => (false, Priority::Medium, USER_MSG_HUMAN, 1.0, true),
        };
        Classification {
            kind,
            retryable,
            priority,
            user_message: user_message.to_string(),
            backoff_multiplier,
            alert_admin,
        }
    }

    fn kind_of(&self, err: &OperationError) -> ErrorKind {
        match err {
            OperationError::Llm(llm) => match llm {
                LlmError::Http(e) => {
                    if e.is_timeout() {
                        ErrorKind::NetworkTimeout
                    } else if e.is_connect() {
                        // reqwest folds DNS resolution failures into connect
                        // errors; the message is the only discriminator.
                        let msg = e.to_string();
                        if msg.contains("dns") || msg.contains("lookup") {
                            ErrorKind::NetworkDns
                        } else {
                            ErrorKind::NetworkRefused
                        }
                    } else {
                        ErrorKind::Unknown
                    }
                }
                LlmError::RateLimited { .. } => ErrorKind::ApiRateLimit,
                LlmError::Api { status, .. } => match status {
                    401 | 403 => ErrorKind::ApiAuth,
                    400 | 422 => ErrorKind::ApiInvalid,
                    503 => ErrorKind::ApiUnavailable,
                    500..=599 => ErrorKind::ApiServer,
                    _ => ErrorKind::Unknown,
                },
                LlmError::MissingCredential => ErrorKind::ApiAuth,
                LlmError::Unavailable(_) => ErrorKind::ApiUnavailable,
                LlmError::Parse(_) => ErrorKind::Unknown,
            },
            OperationError::Database(_) => ErrorKind::Database,
            OperationError::Validation(_) => ErrorKind::Validation,
            OperationError::Timeout { .. } => ErrorKind::NetworkTimeout,
            OperationError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            OperationError::RetryBudgetExhausted => ErrorKind::ApiRateLimit,
            OperationError::Other(_) => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_to_medium_with_triple_backoff() {
        let c = ErrorClassifier::new();
        let class = c.classify(&OperationError::Llm(LlmError::RateLimited {
            retry_after_ms: 1000,
        }));
        assert_eq!(class.kind, ErrorKind::ApiRateLimit);
        assert!(class.retryable);
        assert_eq!(class.priority, Priority::Medium);
        assert_eq!(class.backoff_multiplier, 3.0);
        assert!(!class.alert_admin);
    }

    #[test]
    fn auth_errors_are_terminal_and_alert() {
        let c = ErrorClassifier::new();
        let class = c.classify(&OperationError::Llm(LlmError::Api {
            status: 401,
            message: "unauthorized".into(),
        }));
        assert_eq!(class.kind, ErrorKind::ApiAuth);
        assert!(!class.retryable);
        assert_eq!(class.priority, Priority::Critical);
        assert!(class.alert_admin);
    }

    #[test]
    fn server_errors_distinguish_503() {
        let c = ErrorClassifier::new();
        let unavailable = c.classify(&OperationError::Llm(LlmError::Api {
            status: 503,
            message: String::new(),
        }));
        assert_eq!(unavailable.kind, ErrorKind::ApiUnavailable);
        let server = c.classify(&OperationError::Llm(LlmError::Api {
            status: 500,
            message: String::new(),
        }));
        assert_eq!(server.kind, ErrorKind::ApiServer);
        assert_eq!(server.backoff_multiplier, 1.5);
    }

    #[test]
    fn circuit_open_is_not_retryable() {
        let c = ErrorClassifier::new();
        let class = c.classify(&OperationError::CircuitOpen {
            service: "llm".into(),
        });
        assert_eq!(class.kind, ErrorKind::CircuitOpen);
        assert!(!class.retryable);
    }

    #[test]
    fn database_errors_are_retryable_critical() {
        let c = ErrorClassifier::new();
        let class = c.classify(&OperationError::Database("locked".into()));
        assert!(class.retryable);
        assert_eq!(class.priority, Priority::Critical);
    }
}

pub mod breaker;
pub mod classifier;
pub mod metrics;
pub mod recovery;
pub mod retry;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use classifier::{Classification, ErrorClassifier, ErrorKind, OperationError, Priority};
pub use metrics::ReliabilityMetrics;
pub use recovery::{RecoveryOptions, RecoveryOutcome, RecoveryStrategies, Strategy};
pub use retry::{RetryBudget, RetryPolicy, RetryPolicyConfig};

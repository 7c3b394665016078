use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::classifier::{ErrorClassifier, OperationError};

/// Backoff parameters for one named retry profile.
#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl RetryPolicyConfig {
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 1.5,
            jitter_factor: 0.1,
        }
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 3.0,
            jitter_factor: 0.1,
        }
    }

    /// Look up a profile by its configured name. Unknown names fall back to
    /// `standard`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "aggressive" => Self::aggressive(),
            "conservative" => Self::conservative(),
            _ => Self::standard(),
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Shared cap on retries per rolling window. Bounds worst-case request
/// amplification during an incident: once the budget drains, callers fail
/// fast instead of piling on.
pub struct RetryBudget {
    window: Mutex<VecDeque<Instant>>,
    budget: u32,
    window_duration: Duration,
    exhausted_total: AtomicU64,
}

impl RetryBudget {
    pub fn new(budget: u32, window_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            window: Mutex::new(VecDeque::new()),
            budget,
            window_duration,
            exhausted_total: AtomicU64::new(0),
        })
    }

    /// Take one retry token. Returns false when the rolling window is full.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock().unwrap();
        let cutoff = Instant::now() - self.window_duration;
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        if window.len() as u32 >= self.budget {
            self.exhausted_total.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        window.push_back(Instant::now());
        true
    }

    /// Tokens left in the current window.
    pub fn remaining(&self) -> u32 {
        let mut window = self.window.lock().unwrap();
        let cutoff = Instant::now() - self.window_duration;
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        self.budget.saturating_sub(window.len() as u32)
    }

    /// How many times callers hit an empty budget.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted_total.load(Ordering::Relaxed)
    }
}

/// Executes an operation with bounded retries, exponential backoff, jitter,
/// and the shared retry budget.
pub struct RetryPolicy {
    config: RetryPolicyConfig,
    budget: Arc<RetryBudget>,
    classifier: Arc<ErrorClassifier>,
}

impl RetryPolicy {
    pub fn new(
        config: RetryPolicyConfig,
        budget: Arc<RetryBudget>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            config,
            budget,
            classifier,
        }
    }

    /// Backoff before attempt `attempt` (1-based), before jitter and the
    /// classifier multiplier.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.config.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.config.max_delay.as_secs_f64()))
    }

    /// Full delay: base, clamped, then jittered symmetrically and scaled by
    /// the classification's backoff multiplier.
    fn delay(&self, attempt: u32, backoff_multiplier: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = 1.0 + self.config.jitter_factor * (fastrand::f64() - 0.5) * 2.0;
        Duration::from_secs_f64((base * jitter * backoff_multiplier).max(0.0))
    }

    /// Run `op`, retrying retryable failures until the attempt cap or the
    /// shared budget stops us.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, OperationError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    let class = self.classifier.classify(&e);
                    if !class.retryable || attempt > self.config.max_retries {
                        return Err(e);
                    }
                    if !self.budget.try_acquire() {
                        warn!(kind = %class.kind, "retry budget exhausted, failing fast");
                        return Err(OperationError::RetryBudgetExhausted);
                    }
                    let delay = self.delay(attempt, class.backoff_multiplier);
                    debug!(
                        attempt,
                        kind = %class.kind,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkle_llm::LlmError;
    use std::sync::atomic::AtomicU32;

    fn policy(max_retries: u32, budget: u32) -> RetryPolicy {
        let config = RetryPolicyConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };
        RetryPolicy::new(
            config,
            RetryBudget::new(budget, Duration::from_secs(60)),
            Arc::new(ErrorClassifier::new()),
        )
    }

    fn transient() -> OperationError {
        OperationError::Llm(LlmError::Api {
            status: 500,
            message: "boom".into(),
        })
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = policy(3, 10);
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let policy = policy(3, 10);
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(OperationError::Llm(LlmError::Api {
                        status: 401,
                        message: "no".into(),
                    }))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_budget_fails_fast() {
        let policy = policy(5, 0);
        let result: Result<u32, _> = policy.execute(|| async { Err(transient()) }).await;
        assert!(matches!(result, Err(OperationError::RetryBudgetExhausted)));
    }

    #[test]
    fn budget_window_rolls() {
        let budget = RetryBudget::new(2, Duration::from_secs(60));
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.exhausted_count(), 1);
    }

    #[test]
    fn delay_grows_and_clamps() {
        let policy = policy(3, 10);
        assert!(policy.base_delay(1) < policy.base_delay(2));
        assert_eq!(policy.base_delay(10), Duration::from_millis(4));
    }

    #[test]
    fn profiles_resolve_by_name() {
        assert_eq!(RetryPolicyConfig::from_name("aggressive").max_retries, 5);
        assert_eq!(RetryPolicyConfig::from_name("conservative").max_retries, 2);
        assert_eq!(RetryPolicyConfig::from_name("unknown").max_retries, 3);
    }
}

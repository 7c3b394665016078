use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::classifier::{Classification, ErrorClassifier, OperationError};
use crate::metrics::ReliabilityMetrics;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Primary,
    Cached,
    Degraded,
    Fallback,
}

/// What the recovery ladder produced. `data` is present whenever any tier
/// delivered a value; `classification` explains the primary failure when one
/// occurred.
pub struct RecoveryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub strategy: Strategy,
    pub classification: Option<Classification>,
}

impl<T> RecoveryOutcome<T> {
    /// The classifier's user-safe message for the failure, if any.
    pub fn user_message(&self) -> Option<&str> {
        self.classification.as_ref().map(|c| c.user_message.as_str())
    }
}

/// Fallback tiers for one execution.
pub struct RecoveryOptions<T> {
    /// Key into the recovery cache of last-known-good values.
    pub cache_key: Option<String>,
    /// Degraded-mode producer, e.g. a templated handoff response.
    pub degraded: Option<Box<dyn FnOnce() -> T + Send>>,
    /// Last-resort constant.
    pub fallback: Option<T>,
}

impl<T> Default for RecoveryOptions<T> {
    fn default() -> Self {
        Self {
            cache_key: None,
            degraded: None,
            fallback: None,
        }
    }
}

/// Composes classifier, retry, and breaker with the fallback ladder:
/// primary → cached → degraded → fallback value.
pub struct RecoveryStrategies<T> {
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<ReliabilityMetrics>,
    cache: Mutex<HashMap<String, (Instant, T)>>,
    cache_ttl: Duration,
}

impl<T: Clone + Send> RecoveryStrategies<T> {
    pub fn new(
        classifier: Arc<ErrorClassifier>,
        metrics: Arc<ReliabilityMetrics>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            classifier,
            metrics,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Execute `op` behind breaker+retry; on failure walk the fallback
    /// ladder. Never returns a raw error to the caller.
    pub async fn execute<F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        retry: &RetryPolicy,
        op: F,
        opts: RecoveryOptions<T>,
    ) -> RecoveryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let result = breaker.call(|| retry.execute(|| op())).await;

        match result {
            Ok(data) => {
                if let Some(key) = &opts.cache_key {
                    self.store_cached(key, data.clone());
                }
                self.metrics.record_strategy(Strategy::Primary);
                RecoveryOutcome {
                    success: true,
                    data: Some(data),
                    strategy: Strategy::Primary,
                    classification: None,
                }
            }
            Err(e) => {
                let class = self.classifier.classify(&e);
                self.metrics.record_error(&class);
                if class.alert_admin {
                    warn!(kind = %class.kind, priority = ?class.priority, "alerting error classified");
                }
                self.recover(class, opts)
            }
        }
    }

    /// Remember a known-good value for a later CACHED recovery.
    pub fn store_cached(&self, key: &str, value: T) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(key.to_string(), (Instant::now(), value));
    }

    fn recover(&self, class: Classification, opts: RecoveryOptions<T>) -> RecoveryOutcome<T> {
        if let Some(key) = &opts.cache_key {
            if let Some(data) = self.get_cached(key) {
                debug!(key = %key, "serving cached recovery value");
                self.metrics.record_strategy(Strategy::Cached);
                return RecoveryOutcome {
                    success: true,
                    data: Some(data),
                    strategy: Strategy::Cached,
                    classification: Some(class),
                };
            }
        }

        if let Some(degraded) = opts.degraded {
            self.metrics.record_strategy(Strategy::Degraded);
            return RecoveryOutcome {
                success: true,
                data: Some(degraded()),
                strategy: Strategy::Degraded,
                classification: Some(class),
            };
        }

        if let Some(fallback) = opts.fallback {
            self.metrics.record_strategy(Strategy::Fallback);
            return RecoveryOutcome {
                success: true,
                data: Some(fallback),
                strategy: Strategy::Fallback,
                classification: Some(class),
            };
        }

        RecoveryOutcome {
            success: false,
            data: None,
            strategy: Strategy::Primary,
            classification: Some(class),
        }
    }

    fn get_cached(&self, key: &str) -> Option<T> {
        let cache = self.cache.lock().unwrap();
        let (stored_at, value) = cache.get(key)?;
        if stored_at.elapsed() < self.cache_ttl {
            Some(value.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryBudget, RetryPolicyConfig};
    use sparkle_core::config::BreakerConfig;

    fn harness() -> (RecoveryStrategies<String>, CircuitBreaker, RetryPolicy) {
        let classifier = Arc::new(ErrorClassifier::new());
        let metrics = Arc::new(ReliabilityMetrics::new());
        let strategies = RecoveryStrategies::new(
            classifier.clone(),
            metrics,
            Duration::from_secs(60),
        );
        let breaker = CircuitBreaker::new("test", BreakerConfig {
            failure_threshold: 5,
            window_size: 10,
            open_secs: 30,
            max_backoff_factor: 8,
            adapt_high_error_rate: 0.30,
            adapt_low_error_rate: 0.05,
            health_probe_interval_secs: 30,
        });
        let retry = RetryPolicy::new(
            RetryPolicyConfig {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
                jitter_factor: 0.0,
            },
            RetryBudget::new(10, Duration::from_secs(60)),
            classifier,
        );
        (strategies, breaker, retry)
    }

    #[tokio::test]
    async fn primary_success_populates_cache() {
        let (strategies, breaker, retry) = harness();
        let outcome = strategies
            .execute(
                &breaker,
                &retry,
                || async { Ok("fresh".to_string()) },
                RecoveryOptions {
                    cache_key: Some("k".into()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(outcome.strategy, Strategy::Primary);
        assert_eq!(outcome.data.as_deref(), Some("fresh"));

        // Now fail the primary and expect the cached value back.
        let outcome = strategies
            .execute(
                &breaker,
                &retry,
                || async { Err(OperationError::Other("down".into())) },
                RecoveryOptions {
                    cache_key: Some("k".into()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(outcome.strategy, Strategy::Cached);
        assert_eq!(outcome.data.as_deref(), Some("fresh"));
        assert!(outcome.classification.is_some());
    }

    #[tokio::test]
    async fn ladder_falls_through_to_degraded_then_fallback() {
        let (strategies, breaker, retry) = harness();
        let outcome = strategies
            .execute(
                &breaker,
                &retry,
                || async { Err(OperationError::Other("down".into())) },
                RecoveryOptions {
                    cache_key: None,
                    degraded: Some(Box::new(|| "degraded".to_string())),
                    fallback: Some("fallback".to_string()),
                },
            )
            .await;
        assert_eq!(outcome.strategy, Strategy::Degraded);
        assert_eq!(outcome.data.as_deref(), Some("degraded"));

        let outcome = strategies
            .execute(
                &breaker,
                &retry,
                || async { Err(OperationError::Other("down".into())) },
                RecoveryOptions {
                    cache_key: None,
                    degraded: None,
                    fallback: Some("fallback".to_string()),
                },
            )
            .await;
        assert_eq!(outcome.strategy, Strategy::Fallback);
    }

    #[tokio::test]
    async fn no_tiers_means_failure_with_user_message() {
        let (strategies, breaker, retry) = harness();
        let outcome = strategies
            .execute(
                &breaker,
                &retry,
                || async { Err::<String, _>(OperationError::Other("down".into())) },
                RecoveryOptions::default(),
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.data.is_none());
        assert!(outcome.user_message().is_some());
    }
}

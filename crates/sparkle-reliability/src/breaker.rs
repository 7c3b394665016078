use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sparkle_core::config::BreakerConfig;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier::OperationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Public snapshot for the monitoring endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub error_rate: f64,
    pub current_threshold: u32,
    pub window_len: usize,
    pub opened_total: u64,
}

struct BreakerInner {
    state: CircuitState,
    /// Sliding window of outcomes, true = success.
    window: VecDeque<bool>,
    current_threshold: u32,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_duration: Duration,
    /// Outcomes since the threshold was last raised; a raise requires a full
    /// healthy window.
    since_raise: usize,
}

/// Per-service circuit breaker with an adaptive failure threshold and
/// exponential reopen backoff.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    opened_total: AtomicU64,
}

const MIN_THRESHOLD: u32 = 2;
const MAX_THRESHOLD: u32 = 10;

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let open_duration = Duration::from_secs(config.open_secs);
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                current_threshold: config.failure_threshold,
                consecutive_failures: 0,
                opened_at: None,
                open_duration,
                since_raise: 0,
            }),
            config,
            opened_total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Gate a call. `Ok` admits the caller; in HALF_OPEN exactly one probe
    /// passes (the one that performed the OPEN→HALF_OPEN transition).
    pub fn try_acquire(&self) -> Result<(), OperationError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= inner.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(OperationError::CircuitOpen {
                        service: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => Err(OperationError::CircuitOpen {
                service: self.name.clone(),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.open_duration = Duration::from_secs(self.config.open_secs);
            inner.opened_at = None;
            info!(breaker = %self.name, "probe succeeded, circuit closed");
        }
        self.push_outcome(&mut inner, true);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        self.push_outcome(&mut inner, false);

        match inner.state {
            CircuitState::HalfOpen => {
                let base = Duration::from_secs(self.config.open_secs);
                let doubled = inner.open_duration * 2;
                let cap = base * self.config.max_backoff_factor;
                inner.open_duration = doubled.min(cap);
                self.trip(&mut inner);
                warn!(
                    breaker = %self.name,
                    reopen_secs = inner.open_duration.as_secs(),
                    "probe failed, circuit reopened with backoff"
                );
            }
            CircuitState::Closed if inner.consecutive_failures >= inner.current_threshold => {
                self.trip(&mut inner);
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    threshold = inner.current_threshold,
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Close the breaker directly. Used by the health probe loop after a
    /// successful out-of-band check.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "health probe closed circuit");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.open_duration = Duration::from_secs(self.config.open_secs);
    }

    /// Run `op` behind the breaker, recording the outcome.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, OperationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            error_rate: error_rate(&inner.window),
            current_threshold: inner.current_threshold,
            window_len: inner.window.len(),
            opened_total: self.opened_total.load(Ordering::Relaxed),
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        self.opened_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outcome and adapt the threshold to the window's error rate.
    fn push_outcome(&self, inner: &mut BreakerInner, ok: bool) {
        inner.window.push_back(ok);
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }
        inner.since_raise += 1;

        let rate = error_rate(&inner.window);
        if rate > self.config.adapt_high_error_rate && inner.current_threshold > MIN_THRESHOLD {
            inner.current_threshold = (inner.current_threshold / 2).max(MIN_THRESHOLD);
            inner.since_raise = 0;
            warn!(
                breaker = %self.name,
                threshold = inner.current_threshold,
                error_rate = rate,
                "error rate high, threshold lowered"
            );
        } else if inner.window.len() >= self.config.window_size
            && inner.since_raise >= self.config.window_size
            && rate < self.config.adapt_low_error_rate
            && inner.current_threshold < MAX_THRESHOLD
        {
            inner.current_threshold += 1;
            inner.since_raise = 0;
        }
    }
}

fn error_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let errors = window.iter().filter(|ok| !**ok).count();
    errors as f64 / window.len() as f64
}

/// Named-breaker registry; one breaker per external service or model.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|e| e.value().snapshot()).collect()
    }
}

/// Periodically probe a non-closed breaker and close it when the probe
/// succeeds, so recovery doesn't depend on user traffic.
pub fn spawn_health_probe<F, Fut>(
    breaker: Arc<CircuitBreaker>,
    interval: Duration,
    probe: F,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), OperationError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if breaker.state() == CircuitState::Closed {
                        continue;
                    }
                    match probe().await {
                        Ok(()) => breaker.force_close(),
                        Err(e) => {
                            warn!(breaker = %breaker.name(), err = %e, "health probe failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window_size: 10,
            open_secs: 30,
            max_backoff_factor: 8,
            adapt_high_error_rate: 0.30,
            adapt_low_error_rate: 0.05,
            health_probe_interval_secs: 30,
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = CircuitBreaker::new("llm", config());
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::new("llm", config());
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn threshold_halves_under_high_error_rate() {
        let b = CircuitBreaker::new("llm", config());
        // Mixed traffic that crosses the 30% error-rate bar without a
        // consecutive streak.
        for _ in 0..3 {
            b.record_failure();
            b.record_success();
            b.record_success();
        }
        let snap = b.snapshot();
        assert!(snap.current_threshold <= 2);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let mut cfg = config();
        cfg.open_secs = 0;
        let b = CircuitBreaker::new("llm", cfg);
        for _ in 0..3 {
            b.record_failure();
        }
        // open_secs = 0 so the first acquire flips to half-open.
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_err());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_probe_doubles_open_duration() {
        let mut cfg = config();
        cfg.open_secs = 0;
        let b = CircuitBreaker::new("llm", cfg);
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.try_acquire().is_ok());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn force_close_resets() {
        let b = CircuitBreaker::new("llm", config());
        for _ in 0..3 {
            b.record_failure();
        }
        b.force_close();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let b = CircuitBreaker::new("llm", config());
        let ok: Result<u32, _> = b.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        for _ in 0..3 {
            let _: Result<u32, _> = b
                .call(|| async { Err(OperationError::Other("boom".into())) })
                .await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn registry_reuses_instances() {
        let reg = BreakerRegistry::new(config());
        let a = reg.get_or_create("llm");
        let b = reg.get_or_create("llm");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.snapshot_all().len(), 1);
    }
}

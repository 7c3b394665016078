use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use sparkle_core::config::CanaryConfig;
use sparkle_store::{NewCanaryEvent, Store};
use thiserror::Error;
use tracing::{info, warn};

/// Rollout stages as traffic percentages.
pub const STAGES: [u8; 4] = [10, 25, 50, 100];

/// Latency samples kept per stage for the p95 computation.
const MAX_LATENCY_SAMPLES: usize = 2048;

#[derive(Debug, Error)]
pub enum CanaryError {
    #[error("a canary is already active for variant '{variant}'")]
    AlreadyActive { variant: String },

    #[error("no active canary")]
    NotActive,

    #[error("store error: {0}")]
    Store(#[from] sparkle_store::StoreError),
}

/// Stable-variant baseline captured when the canary starts.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub booking_rate: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Default)]
struct StageCounters {
    samples: u64,
    errors: u64,
    booked: u64,
    latencies: Vec<u64>,
}

impl StageCounters {
    fn error_rate(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.errors as f64 / self.samples as f64
    }

    fn booking_rate(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.booked as f64 / self.samples as f64
    }

    fn p95_latency_ms(&self) -> f64 {
        percentile(&self.latencies, 0.95)
    }
}

struct ActiveCanary {
    canary_variant: String,
    stable_variant: String,
    stage_idx: usize,
    stage_started: Instant,
    auto_promote: bool,
    auto_rollback: bool,
    baseline: Baseline,
    counters: StageCounters,
}

/// Health verdict for the current stage.
#[derive(Debug, Serialize)]
pub struct StageHealth {
    pub healthy: bool,
    pub reasons: Vec<String>,
    pub stage: u8,
    pub samples: u64,
    pub error_rate: f64,
    pub booking_rate: f64,
    pub p95_latency_ms: f64,
    pub baseline: Baseline,
}

#[derive(Debug, Serialize)]
pub struct CanaryStatus {
    pub active: bool,
    pub canary_variant: Option<String>,
    pub stable_variant: Option<String>,
    pub stage: Option<u8>,
    pub stage_elapsed_secs: Option<u64>,
    pub samples: Option<u64>,
    pub auto_promote: Option<bool>,
    pub auto_rollback: Option<bool>,
}

/// What the periodic health tick decided.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub enum TickOutcome {
    Idle,
    Waiting,
    Promoted { to_stage: u8 },
    Completed,
    RolledBack,
    HealthFailed,
}

/// Staged canary rollout: 10% → 25% → 50% → 100% with per-stage health
/// gates. Exactly one canary may be active at a time.
pub struct CanaryController {
    config: CanaryConfig,
    store: Arc<Store>,
    active: Mutex<Option<ActiveCanary>>,
}

impl CanaryController {
    pub fn new(config: CanaryConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            active: Mutex::new(None),
        }
    }

    /// Start a canary at the first stage, snapshotting the stable variant's
    /// baseline for the health gates.
    pub fn start(
        &self,
        canary_variant: &str,
        stable_variant: &str,
        auto_promote: bool,
        auto_rollback: bool,
    ) -> Result<(), CanaryError> {
        let mut active = self.active.lock().unwrap();
        if let Some(existing) = active.as_ref() {
            return Err(CanaryError::AlreadyActive {
                variant: existing.canary_variant.clone(),
            });
        }

        let baseline = self.capture_baseline(stable_variant)?;
        self.record_event(canary_variant, stable_variant, STAGES[0], "start", None)?;
        *active = Some(ActiveCanary {
            canary_variant: canary_variant.to_string(),
            stable_variant: stable_variant.to_string(),
            stage_idx: 0,
            stage_started: Instant::now(),
            auto_promote,
            auto_rollback,
            baseline,
            counters: StageCounters::default(),
        });
        info!(canary_variant, stable_variant, "canary started at 10%");
        Ok(())
    }

    /// Sticky variant assignment for a new session. Returns the canary
    /// variant for the current stage's traffic share.
    pub fn assign_variant(&self, session_seed: &str) -> Option<String> {
        let active = self.active.lock().unwrap();
        let canary = active.as_ref()?;
        let stage = STAGES[canary.stage_idx];
        let mut hasher = DefaultHasher::new();
        session_seed.hash(&mut hasher);
        let bucket = (hasher.finish() % 100) as u8;
        (bucket < stage).then(|| canary.canary_variant.clone())
    }

    /// Record one request outcome attributed to a variant. Only canary
    /// traffic updates the stage counters.
    pub fn record_outcome(&self, variant: &str, ok: bool, latency_ms: u64, booked: bool) {
        let mut active = self.active.lock().unwrap();
        let Some(canary) = active.as_mut() else {
            return;
        };
        if canary.canary_variant != variant {
            return;
        }
        canary.counters.samples += 1;
        if !ok {
            canary.counters.errors += 1;
        }
        if booked {
            canary.counters.booked += 1;
        }
        if canary.counters.latencies.len() < MAX_LATENCY_SAMPLES {
            canary.counters.latencies.push(latency_ms);
        }
    }

    /// Validate the current stage against the health thresholds.
    pub fn validate(&self) -> Result<StageHealth, CanaryError> {
        let active = self.active.lock().unwrap();
        let canary = active.as_ref().ok_or(CanaryError::NotActive)?;
        Ok(self.health_of(canary))
    }

    /// Periodic control step: once a stage has enough samples and has run
    /// its minimum duration, auto-promote on health or auto-rollback on
    /// failure.
    pub fn tick(&self) -> Result<TickOutcome, CanaryError> {
        let mut active = self.active.lock().unwrap();
        let Some(canary) = active.as_mut() else {
            return Ok(TickOutcome::Idle);
        };

        let enough_samples = canary.counters.samples >= self.config.min_samples;
        let enough_time =
            canary.stage_started.elapsed().as_secs() >= self.config.min_stage_secs;
        let health = self.health_of(canary);

        if !health.healthy {
            if canary.auto_rollback {
                self.finish(canary, "rollback", Some(&health.reasons.join("; ")), &health)?;
                *active = None;
                return Ok(TickOutcome::RolledBack);
            }
            self.record_event_with_metrics(canary, "health_fail", Some(&health.reasons.join("; ")), &health)?;
            return Ok(TickOutcome::HealthFailed);
        }

        if !(enough_samples && enough_time) {
            return Ok(TickOutcome::Waiting);
        }

        if !canary.auto_promote {
            return Ok(TickOutcome::Waiting);
        }

        if canary.stage_idx + 1 < STAGES.len() {
            canary.stage_idx += 1;
            canary.stage_started = Instant::now();
            canary.counters = StageCounters::default();
            let stage = STAGES[canary.stage_idx];
            self.record_event_with_metrics(canary, "promote", None, &health)?;
            info!(stage, canary = %canary.canary_variant, "canary promoted");
            Ok(TickOutcome::Promoted { to_stage: stage })
        } else {
            self.finish(canary, "promote", Some("rollout complete"), &health)?;
            *active = None;
            Ok(TickOutcome::Completed)
        }
    }

    /// Manual promotion: advance a stage (or complete at 100%). Overrides
    /// the sample/duration gates.
    pub fn promote(&self) -> Result<TickOutcome, CanaryError> {
        let mut active = self.active.lock().unwrap();
        let canary = active.as_mut().ok_or(CanaryError::NotActive)?;
        let health = self.health_of(canary);
        if canary.stage_idx + 1 < STAGES.len() {
            canary.stage_idx += 1;
            canary.stage_started = Instant::now();
            canary.counters = StageCounters::default();
            let stage = STAGES[canary.stage_idx];
            self.record_event_with_metrics(canary, "promote", Some("manual"), &health)?;
            Ok(TickOutcome::Promoted { to_stage: stage })
        } else {
            self.finish(canary, "promote", Some("manual; rollout complete"), &health)?;
            *active = None;
            Ok(TickOutcome::Completed)
        }
    }

    /// Manual rollback: stable takes all traffic immediately.
    pub fn rollback(&self, reason: &str) -> Result<(), CanaryError> {
        let mut active = self.active.lock().unwrap();
        let canary = active.as_mut().ok_or(CanaryError::NotActive)?;
        let health = self.health_of(canary);
        self.finish(canary, "rollback", Some(reason), &health)?;
        *active = None;
        warn!(reason, "canary rolled back");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), CanaryError> {
        let mut active = self.active.lock().unwrap();
        let canary = active.as_mut().ok_or(CanaryError::NotActive)?;
        let health = self.health_of(canary);
        self.finish(canary, "stop", Some("manual stop"), &health)?;
        *active = None;
        Ok(())
    }

    pub fn status(&self) -> CanaryStatus {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(c) => CanaryStatus {
                active: true,
                canary_variant: Some(c.canary_variant.clone()),
                stable_variant: Some(c.stable_variant.clone()),
                stage: Some(STAGES[c.stage_idx]),
                stage_elapsed_secs: Some(c.stage_started.elapsed().as_secs()),
                samples: Some(c.counters.samples),
                auto_promote: Some(c.auto_promote),
                auto_rollback: Some(c.auto_rollback),
            },
            None => CanaryStatus {
                active: false,
                canary_variant: None,
                stable_variant: None,
                stage: None,
                stage_elapsed_secs: None,
                samples: None,
                auto_promote: None,
                auto_rollback: None,
            },
        }
    }

    /// Stage table with the gate thresholds, for the stages endpoint.
    pub fn stages(&self) -> serde_json::Value {
        serde_json::json!({
            "stages": STAGES,
            "min_samples_per_stage": self.config.min_samples,
            "min_stage_secs": self.config.min_stage_secs,
            "max_error_rate": self.config.max_error_rate,
            "latency_factor": self.config.latency_factor,
            "booking_factor": self.config.booking_factor,
        })
    }

    // --- private helpers ---------------------------------------------------

    fn health_of(&self, canary: &ActiveCanary) -> StageHealth {
        let mut reasons = Vec::new();
        let error_rate = canary.counters.error_rate();
        let booking_rate = canary.counters.booking_rate();
        let p95 = canary.counters.p95_latency_ms();

        if error_rate > self.config.max_error_rate {
            reasons.push(format!(
                "error rate {:.1}% above {:.1}%",
                error_rate * 100.0,
                self.config.max_error_rate * 100.0
            ));
        }
        if canary.baseline.p95_latency_ms > 0.0
            && p95 > canary.baseline.p95_latency_ms * self.config.latency_factor
        {
            reasons.push(format!(
                "p95 latency {p95:.0}ms above {:.0}ms baseline gate",
                canary.baseline.p95_latency_ms * self.config.latency_factor
            ));
        }
        // Booking-rate gate only becomes meaningful once real traffic flowed.
        if canary.counters.samples >= self.config.min_samples
            && canary.baseline.booking_rate > 0.0
            && booking_rate < canary.baseline.booking_rate * self.config.booking_factor
        {
            reasons.push(format!(
                "booking rate {:.1}% below {:.1}% baseline gate",
                booking_rate * 100.0,
                canary.baseline.booking_rate * self.config.booking_factor * 100.0
            ));
        }

        StageHealth {
            healthy: reasons.is_empty(),
            reasons,
            stage: STAGES[canary.stage_idx],
            samples: canary.counters.samples,
            error_rate,
            booking_rate,
            p95_latency_ms: p95,
            baseline: canary.baseline.clone(),
        }
    }

    fn capture_baseline(&self, stable_variant: &str) -> Result<Baseline, CanaryError> {
        let since = (chrono::Utc::now() - chrono::Duration::days(7)).to_rfc3339();
        let (_, booking_rate) = self.store.booking_rate_since(stable_variant, &since)?;
        let times = self
            .store
            .response_times_since(stable_variant, &since, MAX_LATENCY_SAMPLES)?;
        let latencies: Vec<u64> = times.iter().map(|t| (*t).max(0) as u64).collect();
        Ok(Baseline {
            booking_rate,
            p95_latency_ms: percentile(&latencies, 0.95),
        })
    }

    fn finish(
        &self,
        canary: &ActiveCanary,
        event: &str,
        reason: Option<&str>,
        health: &StageHealth,
    ) -> Result<(), CanaryError> {
        self.record_event_with_metrics(canary, event, reason, health)
    }

    fn record_event_with_metrics(
        &self,
        canary: &ActiveCanary,
        event: &str,
        reason: Option<&str>,
        health: &StageHealth,
    ) -> Result<(), CanaryError> {
        let snapshot = serde_json::to_string(health).unwrap_or_default();
        self.store.insert_canary_event(&NewCanaryEvent {
            canary_variant: &canary.canary_variant,
            stable_variant: &canary.stable_variant,
            stage: STAGES[canary.stage_idx] as i64,
            event,
            reason,
            metrics_snapshot: Some(&snapshot),
        })?;
        Ok(())
    }

    fn record_event(
        &self,
        canary_variant: &str,
        stable_variant: &str,
        stage: u8,
        event: &str,
        reason: Option<&str>,
    ) -> Result<(), CanaryError> {
        self.store.insert_canary_event(&NewCanaryEvent {
            canary_variant,
            stable_variant,
            stage: stage as i64,
            event,
            reason,
            metrics_snapshot: None,
        })?;
        Ok(())
    }
}

fn percentile(samples: &[u64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<u64> = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> CanaryController {
        let config = CanaryConfig {
            min_samples: 10,
            min_stage_secs: 0,
            ..CanaryConfig::default()
        };
        CanaryController::new(config, Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn only_one_canary_at_a_time() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        let err = c.start("casual", "baseline", true, true).unwrap_err();
        assert!(matches!(err, CanaryError::AlreadyActive { .. }));
    }

    #[test]
    fn assignment_is_sticky_and_bounded() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        // The same seed always maps to the same side.
        let a1 = c.assign_variant("session-42");
        let a2 = c.assign_variant("session-42");
        assert_eq!(a1, a2);
        // At stage 10% roughly a tenth of seeds land on the canary.
        let hits = (0..1000)
            .filter(|i| c.assign_variant(&format!("seed-{i}")).is_some())
            .count();
        assert!(hits > 20 && hits < 250, "unexpected assignment share: {hits}");
    }

    #[test]
    fn healthy_stage_auto_promotes() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        for _ in 0..20 {
            c.record_outcome("professional", true, 100, true);
        }
        let outcome = c.tick().unwrap();
        assert_eq!(outcome, TickOutcome::Promoted { to_stage: 25 });
        assert_eq!(c.status().stage, Some(25));
    }

    #[test]
    fn unhealthy_stage_auto_rolls_back() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        // 20% error rate blows the 5% gate.
        for i in 0..20 {
            c.record_outcome("professional", i % 5 != 0, 100, false);
        }
        let outcome = c.tick().unwrap();
        assert_eq!(outcome, TickOutcome::RolledBack);
        assert!(!c.status().active);
    }

    #[test]
    fn insufficient_samples_wait() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        for _ in 0..9 {
            c.record_outcome("professional", true, 100, true);
        }
        assert_eq!(c.tick().unwrap(), TickOutcome::Waiting);
        assert_eq!(c.status().stage, Some(10));
    }

    #[test]
    fn full_rollout_completes() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        for _ in 0..3 {
            for _ in 0..10 {
                c.record_outcome("professional", true, 100, true);
            }
            assert!(matches!(c.tick().unwrap(), TickOutcome::Promoted { .. }));
        }
        for _ in 0..10 {
            c.record_outcome("professional", true, 100, true);
        }
        assert_eq!(c.tick().unwrap(), TickOutcome::Completed);
        assert!(!c.status().active);
    }

    #[test]
    fn manual_rollback_records_event() {
        let c = controller();
        c.start("professional", "baseline", true, false).unwrap();
        c.rollback("operator decision").unwrap();
        assert!(!c.status().active);
        let events = c.store.list_canary_events(10).unwrap();
        assert!(events.iter().any(|e| e.event == "rollback"));
        assert!(events.iter().any(|e| e.event == "start"));
    }

    #[test]
    fn stable_traffic_does_not_count() {
        let c = controller();
        c.start("professional", "baseline", true, true).unwrap();
        c.record_outcome("baseline", false, 100, false);
        assert_eq!(c.status().samples, Some(0));
    }
}

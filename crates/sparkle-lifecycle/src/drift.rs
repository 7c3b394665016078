use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use sparkle_core::config::DriftConfig;
use sparkle_store::{aggregates::WindowStats, NewDriftDetection, Store};
use tracing::{info, instrument, warn};

use crate::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
}

impl DriftSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::Low => "low",
            DriftSeverity::Medium => "medium",
            DriftSeverity::High => "high",
        }
    }
}

/// One drifted metric with its window values.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDrift {
    pub metric: String,
    pub baseline: f64,
    pub recent: f64,
    pub delta: f64,
    /// Breach at twice the configured threshold.
    pub severe: bool,
}

/// Full result of one drift check.
#[derive(Debug, Clone, Serialize)]
pub struct DriftAnalysis {
    pub variant: String,
    pub overall_drift: bool,
    pub insufficient_data: bool,
    pub drifts: Vec<MetricDrift>,
    pub severity: DriftSeverity,
    pub baseline_window: String,
    pub recent_window: String,
    pub baseline_samples: u64,
    pub recent_samples: u64,
    pub chi_squared: f64,
    pub computed_at: String,
}

/// Compares a variant's recent window against its baseline on booking rate,
/// escalation rate, cost, response time, and action distribution. Results
/// are cached for five minutes per variant.
pub struct DriftDetector {
    config: DriftConfig,
    store: Arc<Store>,
    cache: DashMap<String, (Instant, DriftAnalysis)>,
}

impl DriftDetector {
    pub fn new(config: DriftConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            cache: DashMap::new(),
        }
    }

    /// Run (or serve from cache) the drift analysis for one variant.
    #[instrument(skip(self))]
    pub fn detect(&self, variant: &str) -> Result<DriftAnalysis, LifecycleError> {
        if let Some(entry) = self.cache.get(variant) {
            let (computed, analysis) = entry.value();
            if computed.elapsed().as_secs() < self.config.cache_ttl_secs.max(0) as u64 {
                return Ok(analysis.clone());
            }
        }

        let analysis = self.compute(variant)?;
        if analysis.overall_drift {
            let drift_types: Vec<&str> =
                analysis.drifts.iter().map(|d| d.metric.as_str()).collect();
            let metrics = serde_json::to_string(&analysis.drifts).unwrap_or_default();
            let row = NewDriftDetection {
                variant,
                drift_types: &drift_types.join(","),
                severity: analysis.severity.as_str(),
                baseline_window: &analysis.baseline_window,
                recent_window: &analysis.recent_window,
                metrics: &metrics,
            };
            if let Err(e) = self.store.insert_drift_detection(&row) {
                warn!(err = %e, "failed to persist drift detection");
            }
            info!(
                variant,
                severity = analysis.severity.as_str(),
                drifts = analysis.drifts.len(),
                "drift detected"
            );
        }
        self.cache
            .insert(variant.to_string(), (Instant::now(), analysis.clone()));
        Ok(analysis)
    }

    /// Drop cached analyses, forcing recomputation on the next detect call.
    pub fn clear_cache(&self, variant: Option<&str>) {
        match variant {
            Some(v) => {
                self.cache.remove(v);
            }
            None => self.cache.clear(),
        }
    }

    fn compute(&self, variant: &str) -> Result<DriftAnalysis, LifecycleError> {
        let now = chrono::Utc::now();
        let recent_start = now - chrono::Duration::hours(self.config.recent_hours);
        let baseline_start = now - chrono::Duration::days(self.config.baseline_days);

        let baseline_from = baseline_start.to_rfc3339();
        let baseline_to = recent_start.to_rfc3339();
        let recent_from = recent_start.to_rfc3339();
        let recent_to = now.to_rfc3339();

        let baseline = self
            .store
            .conversation_window_stats(variant, &baseline_from, &baseline_to)?;
        let recent = self
            .store
            .conversation_window_stats(variant, &recent_from, &recent_to)?;

        let baseline_window = format!("{baseline_from}..{baseline_to}");
        let recent_window = format!("{recent_from}..{recent_to}");

        if baseline.conversations < self.config.min_samples_for_comparison
            || recent.conversations < self.config.min_samples_for_comparison
        {
            return Ok(DriftAnalysis {
                variant: variant.to_string(),
                overall_drift: false,
                insufficient_data: true,
                drifts: Vec::new(),
                severity: DriftSeverity::Low,
                baseline_window,
                recent_window,
                baseline_samples: baseline.conversations,
                recent_samples: recent.conversations,
                chi_squared: 0.0,
                computed_at: now.to_rfc3339(),
            });
        }

        let mut drifts = Vec::new();

        // Booking rate: drift on an absolute drop.
        let booking_delta = recent.booking_rate - baseline.booking_rate;
        if booking_delta <= -self.config.booking_rate_threshold {
            drifts.push(MetricDrift {
                metric: "booking_rate".to_string(),
                baseline: baseline.booking_rate,
                recent: recent.booking_rate,
                delta: booking_delta,
                severe: booking_delta <= -2.0 * self.config.booking_rate_threshold,
            });
        }

        // Escalation rate: drift on an absolute rise.
        let escalation_delta = recent.escalation_rate - baseline.escalation_rate;
        if escalation_delta >= self.config.escalation_rate_threshold {
            drifts.push(MetricDrift {
                metric: "escalation_rate".to_string(),
                baseline: baseline.escalation_rate,
                recent: recent.escalation_rate,
                delta: escalation_delta,
                severe: escalation_delta >= 2.0 * self.config.escalation_rate_threshold,
            });
        }

        // Cost: drift on a relative rise.
        if baseline.avg_cost_usd > 0.0 {
            let cost_delta = (recent.avg_cost_usd - baseline.avg_cost_usd) / baseline.avg_cost_usd;
            if cost_delta >= self.config.cost_increase_threshold {
                drifts.push(MetricDrift {
                    metric: "cost".to_string(),
                    baseline: baseline.avg_cost_usd,
                    recent: recent.avg_cost_usd,
                    delta: cost_delta,
                    severe: cost_delta >= 2.0 * self.config.cost_increase_threshold,
                });
            }
        }

        // Response time: drift on a relative rise.
        if baseline.avg_response_time_ms > 0.0 {
            let rt_delta = (recent.avg_response_time_ms - baseline.avg_response_time_ms)
                / baseline.avg_response_time_ms;
            if rt_delta >= self.config.response_time_threshold {
                drifts.push(MetricDrift {
                    metric: "response_time".to_string(),
                    baseline: baseline.avg_response_time_ms,
                    recent: recent.avg_response_time_ms,
                    delta: rt_delta,
                    severe: rt_delta >= 2.0 * self.config.response_time_threshold,
                });
            }
        }

        // Action distribution: chi-squared goodness of fit of the recent
        // histogram against baseline proportions.
        let chi_squared = chi_squared_stat(&baseline, &recent);
        if chi_squared > self.config.chi_squared_critical {
            drifts.push(MetricDrift {
                metric: "action_distribution".to_string(),
                baseline: self.config.chi_squared_critical,
                recent: chi_squared,
                delta: chi_squared - self.config.chi_squared_critical,
                severe: chi_squared > 2.0 * self.config.chi_squared_critical,
            });
        }

        let severity = severity_of(&drifts);
        Ok(DriftAnalysis {
            variant: variant.to_string(),
            overall_drift: !drifts.is_empty(),
            insufficient_data: false,
            drifts,
            severity,
            baseline_window,
            recent_window,
            baseline_samples: baseline.conversations,
            recent_samples: recent.conversations,
            chi_squared,
            computed_at: now.to_rfc3339(),
        })
    }
}

fn severity_of(drifts: &[MetricDrift]) -> DriftSeverity {
    if drifts.iter().any(|d| d.severe) || drifts.len() >= 3 {
        DriftSeverity::High
    } else if drifts.len() == 2 {
        DriftSeverity::Medium
    } else {
        DriftSeverity::Low
    }
}

/// Chi-squared statistic over the union of observed actions, with add-one
/// smoothing so actions unseen in the baseline don't divide by zero.
fn chi_squared_stat(baseline: &WindowStats, recent: &WindowStats) -> f64 {
    let recent_total: u64 = recent.action_counts.values().sum();
    let baseline_total: u64 = baseline.action_counts.values().sum();
    if recent_total == 0 || baseline_total == 0 {
        return 0.0;
    }

    let categories: HashSet<&String> = baseline
        .action_counts
        .keys()
        .chain(recent.action_counts.keys())
        .collect();
    let k = categories.len() as f64;

    let mut stat = 0.0;
    for category in categories {
        let observed = *recent.action_counts.get(category).unwrap_or(&0) as f64;
        let base = *baseline.action_counts.get(category).unwrap_or(&0) as f64;
        let expected_p = (base + 1.0) / (baseline_total as f64 + k);
        let expected = expected_p * recent_total as f64;
        stat += (observed - expected).powi(2) / expected;
    }
    stat
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkle_store::NewMessage;

    /// Insert a conversation with explicit timestamps by writing through the
    /// public API and then rewinding started_at via raw SQL is unavailable;
    /// instead we seed both windows with current-time rows and shrink the
    /// baseline window so "recent" and "baseline" split on variant names.
    /// For unit purposes we drive `compute` indirectly through seeded stats.
    fn seed_window(store: &Store, variant: &str, n: usize, booked_every: usize, escalated_every: usize, cost: f64, action: &str) {
        for i in 0..n {
            let session = format!("{variant}-{i}-{}", uuid::Uuid::new_v4());
            let id = store.insert_conversation(&session, variant, 1).unwrap();
            store.update_conversation_rolling(&id, 2, 100, cost).unwrap();
            if booked_every > 0 && i % booked_every == 0 {
                store.set_booking_completed(&id).unwrap();
            }
            if escalated_every > 0 && i % escalated_every == 0 {
                store.set_escalated(&id).unwrap();
            }
            store
                .insert_message(&NewMessage {
                    conversation_id: &id,
                    role: "assistant",
                    content: "ok",
                    action: Some(action),
                    tokens: 50,
                    cost_usd: cost,
                    model: Some("fast"),
                    temperature: None,
                    response_time_ms: 200,
                })
                .unwrap();
        }
    }

    fn detector(store: Arc<Store>) -> DriftDetector {
        let config = DriftConfig {
            min_samples_for_comparison: 5,
            // Recent window of zero hours makes "baseline" cover everything
            // seeded now and "recent" cover nothing; tests that need both
            // windows populated use compute() on synthetic WindowStats
            // instead.
            ..DriftConfig::default()
        };
        DriftDetector::new(config, store)
    }

    #[test]
    fn insufficient_data_reports_no_drift() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_window(&store, "baseline", 3, 2, 0, 0.002, "collect_info");
        let d = detector(store);
        let analysis = d.detect("baseline").unwrap();
        assert!(analysis.insufficient_data);
        assert!(!analysis.overall_drift);
    }

    #[test]
    fn cache_serves_second_call() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let d = detector(store.clone());
        let first = d.detect("baseline").unwrap();
        // Mutating the store between calls does not change the cached result.
        seed_window(&store, "baseline", 10, 2, 0, 0.002, "collect_info");
        let second = d.detect("baseline").unwrap();
        assert_eq!(first.computed_at, second.computed_at);

        d.clear_cache(Some("baseline"));
        let third = d.detect("baseline").unwrap();
        assert_ne!(first.computed_at, third.computed_at);
    }

    #[test]
    fn severity_ladder() {
        let drift = |severe| MetricDrift {
            metric: "m".to_string(),
            baseline: 0.0,
            recent: 0.0,
            delta: 0.0,
            severe,
        };
        assert_eq!(severity_of(&[drift(false)]), DriftSeverity::Low);
        assert_eq!(severity_of(&[drift(false), drift(false)]), DriftSeverity::Medium);
        assert_eq!(
            severity_of(&[drift(false), drift(false), drift(false)]),
            DriftSeverity::High
        );
        assert_eq!(severity_of(&[drift(true)]), DriftSeverity::High);
    }

    #[test]
    fn chi_squared_flags_distribution_shift() {
        use std::collections::HashMap;
        let stats = |counts: &[(&str, u64)]| WindowStats {
            conversations: 100,
            booking_rate: 0.5,
            escalation_rate: 0.1,
            avg_cost_usd: 0.002,
            avg_response_time_ms: 200.0,
            action_counts: counts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>(),
        };
        let baseline = stats(&[("collect_info", 60), ("book_appointment", 30), ("escalate", 10)]);
        let same = stats(&[("collect_info", 58), ("book_appointment", 32), ("escalate", 10)]);
        assert!(chi_squared_stat(&baseline, &same) < 9.488);

        let shifted = stats(&[("collect_info", 20), ("book_appointment", 10), ("escalate", 70)]);
        assert!(chi_squared_stat(&baseline, &shifted) > 9.488);
    }
}

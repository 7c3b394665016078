use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::classifier::{Classification, ErrorKind};
use crate::recovery::Strategy;

const MAX_ALERTS: usize = 50;

/// One admin-alertable classification, kept for the monitoring endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub kind: ErrorKind,
    pub priority: String,
    pub at: String,
}

#[derive(Debug, Serialize)]
pub struct RecoveryCounts {
    pub primary: u64,
    pub cached: u64,
    pub degraded: u64,
    pub fallback: u64,
}

#[derive(Debug, Serialize)]
pub struct ReliabilitySnapshot {
    pub errors_by_kind: HashMap<String, u64>,
    pub recoveries: RecoveryCounts,
    pub alerts: Vec<AlertRecord>,
    pub total_errors: u64,
}

/// Process-wide reliability counters. All methods are concurrent-safe.
#[derive(Default)]
pub struct ReliabilityMetrics {
    errors_by_kind: Mutex<HashMap<ErrorKind, u64>>,
    primary: AtomicU64,
    cached: AtomicU64,
    degraded: AtomicU64,
    fallback: AtomicU64,
    total_errors: AtomicU64,
    alerts: Mutex<VecDeque<AlertRecord>>,
}

impl ReliabilityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, class: &Classification) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        *self
            .errors_by_kind
            .lock()
            .unwrap()
            .entry(class.kind)
            .or_insert(0) += 1;
        if class.alert_admin {
            let mut alerts = self.alerts.lock().unwrap();
            if alerts.len() >= MAX_ALERTS {
                alerts.pop_front();
            }
            alerts.push_back(AlertRecord {
                kind: class.kind,
                priority: format!("{:?}", class.priority).to_uppercase(),
                at: chrono::Utc::now().to_rfc3339(),
            });
        }
    }

    pub fn record_strategy(&self, strategy: Strategy) {
        let counter = match strategy {
            Strategy::Primary => &self.primary,
            Strategy::Cached => &self.cached,
            Strategy::Degraded => &self.degraded,
            Strategy::Fallback => &self.fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReliabilitySnapshot {
        let errors_by_kind = self
            .errors_by_kind
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect();
        ReliabilitySnapshot {
            errors_by_kind,
            recoveries: RecoveryCounts {
                primary: self.primary.load(Ordering::Relaxed),
                cached: self.cached.load(Ordering::Relaxed),
                degraded: self.degraded.load(Ordering::Relaxed),
                fallback: self.fallback.load(Ordering::Relaxed),
            },
            alerts: self.alerts.lock().unwrap().iter().cloned().collect(),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorClassifier;

    #[test]
    fn alert_ring_is_bounded() {
        let metrics = ReliabilityMetrics::new();
        let classifier = ErrorClassifier::new();
        let class = classifier.entry(ErrorKind::NetworkDns);
        for _ in 0..(MAX_ALERTS + 10) {
            metrics.record_error(&class);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.alerts.len(), MAX_ALERTS);
        assert_eq!(snap.total_errors, (MAX_ALERTS + 10) as u64);
        assert_eq!(snap.errors_by_kind["network_dns"], (MAX_ALERTS + 10) as u64);
    }
}

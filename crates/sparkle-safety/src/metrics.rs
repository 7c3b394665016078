use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide safety counters, read by the dashboard and the Prometheus
/// exporter. All fields are atomics; increments happen on the hot path.
#[derive(Debug, Default)]
pub struct SafetyMetrics {
    pub checks_total: AtomicU64,
    pub blocked_total: AtomicU64,
    pub input_validation_blocks: AtomicU64,
    pub pii_blocks: AtomicU64,
    pub pii_warnings: AtomicU64,
    pub jailbreak_blocks: AtomicU64,
    pub content_blocks: AtomicU64,
    pub output_leaks: AtomicU64,
    pub output_pii_redactions: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct SafetySnapshot {
    pub checks_total: u64,
    pub blocked_total: u64,
    pub input_validation_blocks: u64,
    pub pii_blocks: u64,
    pub pii_warnings: u64,
    pub jailbreak_blocks: u64,
    pub content_blocks: u64,
    pub output_leaks: u64,
    pub output_pii_redactions: u64,
    pub block_rate: f64,
}

impl SafetyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        let checks = self.checks_total.load(Ordering::Relaxed);
        let blocked = self.blocked_total.load(Ordering::Relaxed);
        SafetySnapshot {
            checks_total: checks,
            blocked_total: blocked,
            input_validation_blocks: self.input_validation_blocks.load(Ordering::Relaxed),
            pii_blocks: self.pii_blocks.load(Ordering::Relaxed),
            pii_warnings: self.pii_warnings.load(Ordering::Relaxed),
            jailbreak_blocks: self.jailbreak_blocks.load(Ordering::Relaxed),
            content_blocks: self.content_blocks.load(Ordering::Relaxed),
            output_leaks: self.output_leaks.load(Ordering::Relaxed),
            output_pii_redactions: self.output_pii_redactions.load(Ordering::Relaxed),
            block_rate: if checks == 0 {
                0.0
            } else {
                blocked as f64 / checks as f64
            },
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

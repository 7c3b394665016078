use std::sync::Mutex;

use serde::Serialize;
use sparkle_core::config::{BudgetConfig, ModelSpec};
use sparkle_core::{ChatMessage, Role};
use tracing::{info, warn};

use crate::complexity::estimate_tokens;

/// Rolling spend for one calendar bucket (day or month).
#[derive(Debug, Clone, Default)]
struct SpendWindow {
    /// Bucket label: "2026-08-01" for days, "2026-08" for months.
    bucket: String,
    usd: f64,
    tokens: u64,
}

impl SpendWindow {
    fn roll(&mut self, bucket: &str) {
        if self.bucket != bucket {
            self.bucket = bucket.to_string();
            self.usd = 0.0;
            self.tokens = 0;
        }
    }
}

/// Outcome of the per-request budget check.
#[derive(Debug)]
pub enum BudgetDecision {
    /// Within budget; messages unchanged.
    Ok { estimated_cost_usd: f64 },
    /// History was trimmed to fit; use these messages instead.
    Trimmed {
        messages: Vec<ChatMessage>,
        estimated_cost_usd: f64,
        dropped: usize,
    },
    /// Over a hard cap; the request must not run.
    Rejected { reason: String },
}

#[derive(Debug, Serialize)]
pub struct BudgetStatus {
    pub daily_spent_usd: f64,
    pub daily_limit_usd: f64,
    pub daily_fraction: f64,
    pub monthly_spent_usd: f64,
    pub monthly_limit_usd: f64,
    pub monthly_fraction: f64,
    pub per_request_limit_usd: f64,
    pub alert: bool,
}

/// Enforces per-request, daily, and monthly token/USD caps, trimming
/// conversation history when allowed.
pub struct BudgetManager {
    config: BudgetConfig,
    day: Mutex<SpendWindow>,
    month: Mutex<SpendWindow>,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            day: Mutex::new(SpendWindow::default()),
            month: Mutex::new(SpendWindow::default()),
        }
    }

    /// Restore today's and this month's spend from the store at startup so
    /// restarts don't reset the caps.
    pub fn seed(&self, daily_usd: f64, monthly_usd: f64) {
        let (day_bucket, month_bucket) = buckets();
        let mut day = self.day.lock().unwrap();
        day.bucket = day_bucket;
        day.usd = daily_usd;
        let mut month = self.month.lock().unwrap();
        month.bucket = month_bucket;
        month.usd = monthly_usd;
    }

    /// Validate one request against every cap. The daily and monthly caps are
    /// hard; the per-request caps trim history when `auto_trim` is on.
    pub fn check_request(&self, messages: &[ChatMessage], model: &ModelSpec) -> BudgetDecision {
        // Hard calendar caps first.
        let estimated = self.estimate_cost(messages, model);
        {
            let (day_bucket, _) = buckets();
            let mut day = self.day.lock().unwrap();
            day.roll(&day_bucket);
            if day.usd + estimated > self.config.daily_usd {
                warn!(spent = day.usd, "daily budget exhausted");
                return BudgetDecision::Rejected {
                    reason: "daily budget limit reached".to_string(),
                };
            }
        }
        {
            let (_, month_bucket) = buckets();
            let mut month = self.month.lock().unwrap();
            month.roll(&month_bucket);
            if month.usd + estimated > self.config.monthly_usd {
                warn!(spent = month.usd, "monthly budget exhausted");
                return BudgetDecision::Rejected {
                    reason: "monthly budget limit reached".to_string(),
                };
            }
        }

        if self.within_request_caps(messages, model) {
            return BudgetDecision::Ok {
                estimated_cost_usd: estimated,
            };
        }

        if !self.config.auto_trim {
            return BudgetDecision::Rejected {
                reason: "request exceeds per-request budget".to_string(),
            };
        }

        // Trim oldest non-system messages, preserving the system prompt and
        // the two most recent turns.
        let mut trimmed = messages.to_vec();
        let mut dropped = 0usize;
        while !self.within_request_caps(&trimmed, model) {
            let Some(idx) = droppable_index(&trimmed) else {
                break;
            };
            trimmed.remove(idx);
            dropped += 1;
        }

        if !self.within_request_caps(&trimmed, model) {
            return BudgetDecision::Rejected {
                reason: "request exceeds per-request budget even after trimming".to_string(),
            };
        }

        let estimated = self.estimate_cost(&trimmed, model);
        info!(dropped, "conversation history trimmed to budget");
        BudgetDecision::Trimmed {
            messages: trimmed,
            estimated_cost_usd: estimated,
            dropped,
        }
    }

    /// Record actual spend after a completed request.
    pub fn record_spend(&self, usd: f64, tokens: u64) {
        let (day_bucket, month_bucket) = buckets();
        {
            let mut day = self.day.lock().unwrap();
            day.roll(&day_bucket);
            day.usd += usd;
            day.tokens += tokens;
        }
        {
            let mut month = self.month.lock().unwrap();
            month.roll(&month_bucket);
            month.usd += usd;
            month.tokens += tokens;
        }
    }

    pub fn status(&self) -> BudgetStatus {
        let (day_bucket, month_bucket) = buckets();
        let daily_spent = {
            let mut day = self.day.lock().unwrap();
            day.roll(&day_bucket);
            day.usd
        };
        let monthly_spent = {
            let mut month = self.month.lock().unwrap();
            month.roll(&month_bucket);
            month.usd
        };
        let daily_fraction = daily_spent / self.config.daily_usd;
        let monthly_fraction = monthly_spent / self.config.monthly_usd;
        BudgetStatus {
            daily_spent_usd: daily_spent,
            daily_limit_usd: self.config.daily_usd,
            daily_fraction,
            monthly_spent_usd: monthly_spent,
            monthly_limit_usd: self.config.monthly_usd,
            monthly_fraction,
            per_request_limit_usd: self.config.per_request_usd,
            alert: daily_fraction >= self.config.alert_fraction
                || monthly_fraction >= self.config.alert_fraction,
        }
    }

    pub fn estimate_input_tokens(&self, messages: &[ChatMessage]) -> u32 {
        messages.iter().map(|m| estimate_tokens(&m.content)).sum()
    }

    /// Worst-case request cost: estimated input plus the full output cap.
    pub fn estimate_cost(&self, messages: &[ChatMessage], model: &ModelSpec) -> f64 {
        let input = self.estimate_input_tokens(messages) as f64;
        let output = self.config.per_request_output_tokens as f64;
        (input * model.input_cost_per_mtok + output * model.output_cost_per_mtok) / 1_000_000.0
    }

    fn within_request_caps(&self, messages: &[ChatMessage], model: &ModelSpec) -> bool {
        let input = self.estimate_input_tokens(messages);
        let total = input + self.config.per_request_output_tokens;
        input <= self.config.per_request_input_tokens
            && total <= self.config.per_request_total_tokens
            && self.estimate_cost(messages, model) <= self.config.per_request_usd
    }
}

/// Index of the oldest droppable message: non-system, and not one of the two
/// most recent messages.
fn droppable_index(messages: &[ChatMessage]) -> Option<usize> {
    let protected_from = messages.len().saturating_sub(2);
    messages
        .iter()
        .enumerate()
        .position(|(i, m)| m.role != Role::System && i < protected_from)
}

fn buckets() -> (String, String) {
    let now = chrono::Utc::now();
    (
        now.format("%Y-%m-%d").to_string(),
        now.format("%Y-%m").to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_model() -> ModelSpec {
        ModelSpec {
            id: "fast".to_string(),
            input_cost_per_mtok: 0.05,
            output_cost_per_mtok: 0.08,
        }
    }

    fn manager() -> BudgetManager {
        BudgetManager::new(BudgetConfig::default())
    }

    fn msg(role: Role, len: usize) -> ChatMessage {
        ChatMessage {
            role,
            content: "x".repeat(len),
        }
    }

    #[test]
    fn small_request_passes() {
        let m = manager();
        let messages = vec![msg(Role::System, 400), msg(Role::User, 100)];
        assert!(matches!(
            m.check_request(&messages, &cheap_model()),
            BudgetDecision::Ok { .. }
        ));
    }

    #[test]
    fn oversized_history_is_trimmed_preserving_system_and_recent() {
        let m = manager();
        // System + 10 fat turns: way over the 2000-input-token cap.
        let mut messages = vec![msg(Role::System, 1000)];
        for _ in 0..10 {
            messages.push(msg(Role::User, 1500));
            messages.push(msg(Role::Assistant, 1500));
        }
        match m.check_request(&messages, &cheap_model()) {
            BudgetDecision::Trimmed {
                messages: trimmed,
                dropped,
                ..
            } => {
                assert!(dropped > 0);
                assert_eq!(trimmed[0].role, Role::System);
                assert!(trimmed.len() >= 3);
            }
            other => panic!("expected trim, got {other:?}"),
        }
    }

    #[test]
    fn untrimmable_request_is_rejected() {
        let m = manager();
        // A single user message too large to ever fit.
        let messages = vec![msg(Role::System, 100), msg(Role::User, 20_000)];
        assert!(matches!(
            m.check_request(&messages, &cheap_model()),
            BudgetDecision::Rejected { .. }
        ));
    }

    #[test]
    fn auto_trim_off_rejects_instead() {
        let config = BudgetConfig {
            auto_trim: false,
            ..BudgetConfig::default()
        };
        let m = BudgetManager::new(config);
        let mut messages = vec![msg(Role::System, 1000)];
        for _ in 0..10 {
            messages.push(msg(Role::User, 1500));
        }
        assert!(matches!(
            m.check_request(&messages, &cheap_model()),
            BudgetDecision::Rejected { .. }
        ));
    }

    #[test]
    fn daily_cap_is_hard() {
        let m = manager();
        m.seed(10.0, 10.0);
        let messages = vec![msg(Role::User, 100)];
        assert!(matches!(
            m.check_request(&messages, &cheap_model()),
            BudgetDecision::Rejected { .. }
        ));
    }

    #[test]
    fn status_alerts_at_80_percent() {
        let m = manager();
        m.seed(8.5, 20.0);
        let status = m.status();
        assert!(status.alert);
        assert!(status.daily_fraction > 0.8);
    }

    #[test]
    fn spend_accumulates() {
        let m = manager();
        m.record_spend(0.5, 1000);
        m.record_spend(0.25, 500);
        let status = m.status();
        assert!((status.daily_spent_usd - 0.75).abs() < 1e-9);
        assert!((status.monthly_spent_usd - 0.75).abs() < 1e-9);
    }
}
